use std::future::Future;
use std::time::Duration;

/// Retry `attempt` up to `max_attempts` times with a doubling delay starting
/// at `base`, per `spec.md` §4.3 ("retry with exponential backoff, up to 3
/// attempts; base 100 ms, doubling"). No external retry crate: the teacher
/// has none in its dependency stack and this is a three-line loop.
pub async fn retry<F, Fut, T, E>(max_attempts: u32, base: Duration, mut attempt: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = base;
    for attempt_num in 0..max_attempts {
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt_num + 1 >= max_attempts {
                    return Err(e);
                }
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
    unreachable!("max_attempts must be at least 1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_works() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7) }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_up_to_max_attempts_then_gives_up() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("still failing") }
        })
        .await;
        assert_eq!(result, Err("still failing"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
