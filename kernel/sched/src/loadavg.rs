//! Exponentially decayed load average, sampled once per scheduler tick.
//!
//! Matches the traditional UNIX `fixpt_t` convention also used by
//! [`hadron_syscall::proto::LoadavgResponse`]: each average is a
//! fixed-point value with [`FSHIFT`] fractional bits, updated by
//! `load = load * decay + nr_ready * (1 - decay)` using a per-period
//! decay constant derived from the averaging window.

use hadron_core::sync::SpinLock;

/// Fractional bits in a fixed-point load value.
pub const FSHIFT: u32 = 11;
/// `1.0` in fixed point.
pub const FIXED_1: i64 = 1 << FSHIFT;

/// Decay constants for 1-, 5-, and 15-minute windows, sampled every 5
/// seconds (`exp(-5/60)`, `exp(-5/300)`, `exp(-5/900)` in `FSHIFT`
/// fixed point), matching the reference kernel's `cexp` table.
const EXP: [i64; 3] = [1884, 2014, 2037];

struct LoadAvg {
    loads: [i64; 3],
}

impl LoadAvg {
    const fn new() -> Self {
        Self { loads: [0; 3] }
    }

    fn sample(&mut self, nr_ready: u32) {
        let active = i64::from(nr_ready) * FIXED_1;
        for (load, decay) in self.loads.iter_mut().zip(EXP.iter()) {
            *load = (*load * decay + active * (FIXED_1 - decay)) >> FSHIFT;
        }
    }
}

static LOADAVG: SpinLock<LoadAvg> = SpinLock::named("LOADAVG", LoadAvg::new());

/// Feeds one sample of the current ready-queue depth into the decay
/// filter. Called once per averaging period (every 5 seconds of ticks
/// in the reference convention), not once per scheduler tick.
pub fn sample(nr_ready: u32) {
    LOADAVG.lock().sample(nr_ready);
}

/// Returns the current 1-, 5-, and 15-minute load averages in
/// [`FSHIFT`] fixed point.
#[must_use]
pub fn get() -> [u32; 3] {
    let g = LOADAVG.lock();
    [g.loads[0] as u32, g.loads[1] as u32, g.loads[2] as u32]
}

#[cfg(test)]
mod tests {
    use super::*;
    static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn reset() {
        *LOADAVG.lock() = LoadAvg::new();
    }

    #[test]
    fn starts_at_zero() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        assert_eq!(get(), [0, 0, 0]);
    }

    #[test]
    fn sustained_load_converges_upward() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        for _ in 0..200 {
            sample(4);
        }
        let loads = get();
        // Should approach 4.0 in fixed point but never quite reach it.
        assert!(loads[0] > (3 * FIXED_1 as u32));
        assert!(loads[0] <= 4 * FIXED_1 as u32);
    }

    #[test]
    fn idle_system_decays_back_to_zero() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        for _ in 0..50 {
            sample(10);
        }
        assert!(get()[0] > 0);
        for _ in 0..500 {
            sample(0);
        }
        assert!(get()[0] < FIXED_1 as u32 / 10);
    }
}
