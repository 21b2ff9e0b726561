//! Independent visual re-verification.
//!
//! A candidate that ranked well on embeddings gets cross-checked by a
//! vision-capable judge: preprocess the photo to a bounded encoding, look
//! the (image, query) pair up in the content-addressed cache, and only on a
//! miss call the external judge with retries and exponential backoff.
//!
//! - `preprocess`: quality/resolution ladder under a byte budget
//! - `cache`: write-once verdict cache keyed by content hashes
//! - `judge`: the external judgment protocol

pub mod cache;
pub mod judge;
pub mod preprocess;

use std::time::Duration;

use crate::verify::cache::{cache_key, VerdictCache};
use crate::verify::judge::{JudgeError, Verdict, VisionJudge};
use crate::verify::preprocess::PreprocessError;

/// How strict the confidence cutoff is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrictMode {
    Loose,
    Normal,
    Strict,
}

impl StrictMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "loose" => Some(Self::Loose),
            "normal" => Some(Self::Normal),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }

    pub fn cutoff(self) -> f32 {
        match self {
            Self::Loose => 0.50,
            Self::Normal => 0.65,
            Self::Strict => 0.75,
        }
    }
}

/// Whether a confidence clears the cutoff for the given mode.
pub fn pass_threshold(confidence: f32, mode: StrictMode) -> bool {
    confidence >= mode.cutoff()
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error("unverifiable after {attempts} attempts: {source}")]
    Unverifiable {
        attempts: u32,
        source: JudgeError,
    },
}

/// Cached, retried verification of one candidate against the query.
pub struct Verifier {
    judge: Box<dyn VisionJudge>,
    cache: VerdictCache,
    byte_budget: usize,
    max_attempts: u32,
    base_delay_ms: u64,
}

impl Verifier {
    pub fn new(
        judge: Box<dyn VisionJudge>,
        cache: VerdictCache,
        byte_budget: usize,
        max_attempts: u32,
        base_delay_ms: u64,
    ) -> Self {
        Self {
            judge,
            cache,
            byte_budget,
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    /// Verify one photo against the query.
    ///
    /// A cache hit never touches the judge. A miss calls the judge with up
    /// to `max_attempts` tries; transient failures back off exponentially
    /// with jitter, a permanent failure stops immediately. The failure of
    /// one candidate is local: callers treat `Unverifiable` per policy, it
    /// never aborts the batch.
    pub fn verify(&self, path: &std::path::Path, query: &str) -> Result<Verdict, VerifyError> {
        let image = preprocess::preprocess(path, self.byte_budget)?;
        let key = cache_key(&image, query);

        if let Some(verdict) = self.cache.get(&key) {
            log::debug!("verdict cache hit for {}", path.display());
            return Ok(verdict);
        }

        let verdict = self.judge_with_retries(&image, query)?;
        self.cache.put(&key, &verdict);
        Ok(verdict)
    }

    fn judge_with_retries(&self, image: &[u8], query: &str) -> Result<Verdict, VerifyError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.judge.judge(image, query) {
                Ok(verdict) => return Ok(verdict),
                Err(e @ JudgeError::Transient(_)) if attempt < self.max_attempts => {
                    let delay = backoff_delay(self.base_delay_ms, attempt);
                    log::info!(
                        "judge attempt {attempt}/{} failed ({e}), backing off {}ms",
                        self.max_attempts,
                        delay.as_millis()
                    );
                    std::thread::sleep(delay);
                }
                Err(source) => {
                    return Err(VerifyError::Unverifiable { attempts: attempt, source });
                }
            }
        }
    }
}

/// delay = base · 2^(attempt−1) · uniform[0.8, 1.2]
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let jitter: f64 = rand::random_range(0.8..=1.2);
    Duration::from_millis((exp as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "fotoseek-verify-test-{tag}-{}-{}",
            std::process::id(),
            counter
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_test_photo(dir: &Path, name: &str) -> std::path::PathBuf {
        let img = image::RgbaImage::from_fn(16, 16, |x, y| {
            image::Rgba([(x * 16) as u8, (y * 16) as u8, 128, 255])
        });
        let path = dir.join(name);
        img.save_with_format(&path, image::ImageFormat::Png).unwrap();
        path
    }

    /// Scripted judge: pops one response per call, counts invocations.
    struct ScriptedJudge {
        calls: Arc<AtomicUsize>,
        script: Mutex<Vec<Result<Verdict, JudgeError>>>,
    }

    impl ScriptedJudge {
        fn new(script: Vec<Result<Verdict, JudgeError>>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let judge = Self {
                calls: calls.clone(),
                script: Mutex::new(script),
            };
            (judge, calls)
        }
    }

    impl VisionJudge for ScriptedJudge {
        fn judge(&self, _image: &[u8], _query: &str) -> Result<Verdict, JudgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Err(JudgeError::Transient("script exhausted".to_string()))
            } else {
                script.remove(0)
            }
        }
    }

    fn good_verdict() -> Verdict {
        Verdict {
            matched: true,
            confidence: 0.9,
            rationale: "matches".to_string(),
        }
    }

    fn verifier_with(judge: ScriptedJudge, dir: &Path, max_attempts: u32) -> Verifier {
        Verifier::new(
            Box::new(judge),
            VerdictCache::new(dir.join("verify-cache")),
            preprocess::DEFAULT_BYTE_BUDGET,
            max_attempts,
            1, // near-zero backoff in tests
        )
    }

    #[test]
    fn test_pass_threshold_mapping() {
        assert!(pass_threshold(0.80, StrictMode::Strict));
        assert!(!pass_threshold(0.60, StrictMode::Strict));
        assert!(pass_threshold(0.65, StrictMode::Normal));
        assert!(!pass_threshold(0.60, StrictMode::Normal));
        assert!(pass_threshold(0.50, StrictMode::Loose));
        assert!(!pass_threshold(0.49, StrictMode::Loose));
    }

    #[test]
    fn test_strict_mode_parse() {
        assert_eq!(StrictMode::parse("strict"), Some(StrictMode::Strict));
        assert_eq!(StrictMode::parse("bogus"), None);
    }

    #[test]
    fn test_cache_round_trip_judges_once() {
        let dir = temp_dir("roundtrip");
        let photo = write_test_photo(&dir, "cat.png");

        let (judge, calls) = ScriptedJudge::new(vec![Ok(good_verdict()), Ok(good_verdict())]);
        let verifier = verifier_with(judge, &dir, 3);

        let first = verifier.verify(&photo, "red car").unwrap();
        let second = verifier.verify(&photo, "red car").unwrap();

        assert_eq!(first, second);
        // the second call was served from cache
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_retry_succeeds_on_nth_attempt() {
        let dir = temp_dir("retry-ok");
        let photo = write_test_photo(&dir, "cat.png");

        let (judge, calls) = ScriptedJudge::new(vec![
            Err(JudgeError::Transient("503".to_string())),
            Err(JudgeError::Transient("timeout".to_string())),
            Ok(good_verdict()),
        ]);
        let verifier = verifier_with(judge, &dir, 3);

        let verdict = verifier.verify(&photo, "red car").unwrap();
        assert_eq!(verdict, good_verdict());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_retry_exhaustion_propagates_last_error() {
        let dir = temp_dir("retry-fail");
        let photo = write_test_photo(&dir, "cat.png");

        let (judge, calls) = ScriptedJudge::new(vec![
            Err(JudgeError::Transient("503".to_string())),
            Err(JudgeError::Transient("503".to_string())),
            Err(JudgeError::Transient("503".to_string())),
        ]);
        let verifier = verifier_with(judge, &dir, 3);

        let result = verifier.verify(&photo, "red car");
        assert!(matches!(
            result,
            Err(VerifyError::Unverifiable { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_permanent_error_stops_immediately() {
        let dir = temp_dir("permanent");
        let photo = write_test_photo(&dir, "cat.png");

        let (judge, calls) = ScriptedJudge::new(vec![Err(JudgeError::Permanent("401".to_string()))]);
        let verifier = verifier_with(judge, &dir, 5);

        let result = verifier.verify(&photo, "red car");
        assert!(matches!(
            result,
            Err(VerifyError::Unverifiable { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_failure_is_not_cached() {
        let dir = temp_dir("failure-not-cached");
        let photo = write_test_photo(&dir, "cat.png");

        let (judge, _calls) = ScriptedJudge::new(vec![
            Err(JudgeError::Permanent("400".to_string())),
            Ok(good_verdict()),
        ]);
        let verifier = verifier_with(judge, &dir, 1);

        assert!(verifier.verify(&photo, "red car").is_err());
        // next call reaches the judge and succeeds
        assert_eq!(verifier.verify(&photo, "red car").unwrap(), good_verdict());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_backoff_delay_bounds() {
        for attempt in 1..=4 {
            let delay = backoff_delay(100, attempt);
            let exp = 100u64 * 2u64.pow(attempt - 1);
            let lo = (exp as f64 * 0.8) as u128;
            let hi = (exp as f64 * 1.2) as u128 + 1;
            assert!(delay.as_millis() >= lo && delay.as_millis() <= hi);
        }
    }

    #[test]
    fn test_missing_photo_is_preprocess_error() {
        let dir = temp_dir("missing");
        let (judge, _calls) = ScriptedJudge::new(vec![]);
        let verifier = verifier_with(judge, &dir, 1);

        let result = verifier.verify(Path::new("/no/such/photo.jpg"), "red car");
        assert!(matches!(result, Err(VerifyError::Preprocess(_))));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
