//! Local wall-clock helpers for logfile timestamps and `%D` expansion.

use std::mem::MaybeUninit;

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

pub fn now_t() -> libc::time_t {
    unsafe { libc::time(std::ptr::null_mut()) }
}

pub fn local_tm(t: libc::time_t) -> libc::tm {
    let mut tm = MaybeUninit::<libc::tm>::uninit();
    unsafe {
        libc::localtime_r(&t, tm.as_mut_ptr());
        tm.assume_init()
    }
}

pub fn mktime(tm: &mut libc::tm) -> libc::time_t {
    unsafe { libc::mktime(tm) }
}

/// `YYYY-MM-DD` in local time, for `%D` filename expansion.
pub fn date_string(t: libc::time_t) -> String {
    let tm = local_tm(t);
    format!(
        "{:04}-{:02}-{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday
    )
}

/// Long local time string in asctime order, e.g. `Sun Aug  2 10:15:00 2026`.
pub fn long_time_string(t: libc::time_t) -> String {
    let tm = local_tm(t);
    format!(
        "{} {} {:2} {:02}:{:02}:{:02} {}",
        WEEKDAYS[tm.tm_wday.rem_euclid(7) as usize],
        MONTHS[tm.tm_mon.rem_euclid(12) as usize],
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
        tm.tm_year + 1900,
    )
}

/// The line periodically written into every console logfile.
pub fn stamp_line(console: &str, t: libc::time_t) -> String {
    format!("* Console [{console}] log at {}\r\n", long_time_string(t))
}

/// Wall-clock instant of the next logfile timestamp.
///
/// The first deadline lands on the next multiple of `minutes` past local
/// midnight; each later one is computed from the *intended* previous deadline
/// rather than from now, so timer skew never accumulates.
pub fn next_stamp(prev: Option<libc::time_t>, now: libc::time_t, minutes: u32) -> libc::time_t {
    debug_assert!(minutes > 0);
    let mut tm = match prev {
        None => {
            let mut tm = local_tm(now);
            let completed = (tm.tm_hour * 60 + tm.tm_min) / minutes as libc::c_int;
            tm.tm_hour = 0;
            tm.tm_min = (completed + 1) * minutes as libc::c_int;
            tm
        }
        Some(prev) => {
            let mut tm = local_tm(prev);
            tm.tm_min += minutes as libc::c_int;
            tm
        }
    };
    tm.tm_sec = 0;
    mktime(&mut tm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minute_of_day(t: libc::time_t) -> libc::c_int {
        let tm = local_tm(t);
        tm.tm_hour * 60 + tm.tm_min
    }

    #[test]
    fn first_stamp_is_aligned_to_midnight_multiples() {
        let now = now_t();
        for minutes in [1u32, 5, 15, 60] {
            let next = next_stamp(None, now, minutes);
            assert!(next > now);
            let tm = local_tm(next);
            assert_eq!(tm.tm_sec, 0);
            assert_eq!(minute_of_day(next) % minutes as libc::c_int, 0);
            // Never more than one full period into the future.
            assert!(next - now <= (minutes as libc::time_t) * 60);
        }
    }

    #[test]
    fn later_stamps_step_from_the_intended_deadline() {
        let now = now_t();
        let first = next_stamp(None, now, 15);
        let second = next_stamp(Some(first), now, 15);
        let third = next_stamp(Some(second), now, 15);
        assert_eq!(second - first, 15 * 60);
        assert_eq!(third - second, 15 * 60);
    }

    #[test]
    fn stamp_line_format() {
        let line = stamp_line("web1", now_t());
        assert!(line.starts_with("* Console [web1] log at "));
        assert!(line.ends_with("\r\n"));
    }

    #[test]
    fn date_string_shape() {
        let s = date_string(now_t());
        assert_eq!(s.len(), 10);
        assert_eq!(&s[4..5], "-");
        assert_eq!(&s[7..8], "-");
    }
}
