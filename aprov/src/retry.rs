use std::thread;
use std::time::Duration;

/// Runs `op` up to `attempts` times, sleeping `backoff(attempt)` between
/// tries. The closure receives the zero-based attempt number; the backoff
/// function receives the number of attempts already failed, so the first
/// sleep is `backoff(1)`. Returns the last error when every attempt fails.
pub fn retry<T, E, F, B>(attempts: u32, backoff: B, mut op: F) -> std::result::Result<T, E>
where
    F: FnMut(u32) -> std::result::Result<T, E>,
    B: Fn(u32) -> Duration,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(e);
                }
                let delay = backoff(attempt);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
        }
    }
}

/// The profile-creation schedule: 2^n seconds after the n-th failure,
/// capped so a misconfigured retry count cannot sleep for hours.
pub fn exponential_secs() -> impl Fn(u32) -> Duration {
    |failed| Duration::from_secs(1u64 << failed.min(6))
}

pub fn no_backoff() -> impl Fn(u32) -> Duration {
    |_| Duration::ZERO
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_first_success_short_circuits() {
        let mut calls = 0;
        let res: Result<u32, &str> = retry(3, no_backoff(), |_| {
            calls += 1;
            Ok(7)
        });
        assert_eq!(res, Ok(7));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retries_until_success() {
        let mut calls = 0;
        let res: Result<u32, &str> = retry(3, no_backoff(), |attempt| {
            calls += 1;
            if attempt < 2 {
                Err("not yet")
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(res, Ok(2));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_returns_last_error() {
        let mut calls = 0;
        let res: Result<(), String> = retry(3, no_backoff(), |attempt| {
            calls += 1;
            Err(format!("attempt {attempt}"))
        });
        assert_eq!(res, Err("attempt 2".to_string()));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_exponential_schedule() {
        let backoff = exponential_secs();
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(2), Duration::from_secs(4));
        assert_eq!(backoff(3), Duration::from_secs(8));
        // capped
        assert_eq!(backoff(60), Duration::from_secs(64));
    }
}
