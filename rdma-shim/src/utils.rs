/// A monotonic timer, usable without std
pub struct KTimer {
    start: libc::timespec,
}

impl KTimer {
    pub fn new() -> Self {
        Self { start: now() }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.start = now();
    }

    pub fn get_passed_usec(&self) -> i64 {
        let end = now();
        (end.tv_sec as i64 - self.start.tv_sec as i64) * 1_000_000
            + (end.tv_nsec as i64 - self.start.tv_nsec as i64) / 1_000
    }
}

impl Default for KTimer {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid pointer
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts
}

#[cfg(test)]
mod tests {
    #[test]
    fn timer_moves_forward() {
        let t = super::KTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(t.get_passed_usec() >= 1_000);
    }
}
