//! Retrieval orchestrator: embed the query, rank the collection through
//! the candidate selector, verify the top candidates on a bounded worker
//! pool, blend scores. Reports progress and honors cancellation throughout.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use crate::config::{Config, SearchConfig, SelectorConfig};
use crate::embed::{self, EmbedBackend, EmbedError};
use crate::media::MediaItem;
use crate::rank::{self, RankError};
use crate::select;
use crate::store::VectorStore;
use crate::verify::cache::VerdictCache;
use crate::verify::judge::{RemoteJudge, Verdict};
use crate::verify::{pass_threshold, StrictMode, Verifier, VerifyError};

/// Shared cancellation flag, polled between pipeline steps and before each
/// verification dispatch. In-flight calls finish and are discarded.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One-way progress notification: monotone percent plus a phase label.
pub type ProgressFn = dyn Fn(u8, &str) + Send + Sync;

/// Final entry of a search: blended score, plus its ingredients.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RankedResult {
    pub path: PathBuf,
    pub score: f32,
    pub embedding_score: f32,
    /// Judge confidence; None for unverified or unverifiable candidates.
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub results: Vec<RankedResult>,
    /// False when the judge was unreachable: embedding-only ranking.
    pub verification_available: bool,
    /// True in "no-embedding" degraded mode (no backend on the ladder).
    pub degraded: bool,
    /// True when the search returned early on cancellation; results hold
    /// whatever had completed, which is valid partial output.
    pub cancelled: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// The query itself could not be embedded: nothing to rank, no partial
    /// output, the whole search aborts.
    #[error("query embedding failed: {0}")]
    QueryEmbedding(#[from] EmbedError),

    #[error("ranking failed: {0}")]
    Ranking(#[from] RankError),
}

/// Per-call knobs, seeded from config and overridable by the CLI.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub strictness: StrictMode,
    pub top_k: usize,
    pub verify_top_n: usize,
    pub verify_cap: usize,
    pub alpha: f32,
    pub keep_unverified: bool,
    /// Skip verification entirely (embedding-only ranking).
    pub verify: bool,
}

impl SearchOptions {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            strictness: StrictMode::parse(&config.strictness).unwrap_or(StrictMode::Normal),
            top_k: config.top_k,
            verify_top_n: config.verify_top_n,
            verify_cap: config.verify_cap,
            alpha: config.alpha,
            keep_unverified: config.keep_unverified,
            verify: true,
        }
    }
}

/// `alpha * confidence + (1 - alpha) * embedding_score`
pub fn blend(alpha: f32, confidence: f32, embedding_score: f32) -> f32 {
    alpha * confidence + (1.0 - alpha) * embedding_score
}

/// The pipeline: backend + store + verifier, constructed once and reused.
pub struct SearchPipeline {
    pub(crate) backend: Option<Box<dyn EmbedBackend>>,
    pub(crate) store: Option<VectorStore>,
    pub(crate) verifier: Option<Verifier>,
    pub(crate) selector: SelectorConfig,
    pub(crate) workers: usize,
}

impl SearchPipeline {
    /// Build from config: evaluate the embedding fallback ladder once, open
    /// the vector store for the chosen backend, and set up the judge if
    /// credentials allow.
    pub fn from_config(config: &Config) -> Self {
        let base = config.base_path();

        let backend = embed::select_backend(&config.embedder, base);
        let store = backend.as_ref().map(|b| {
            VectorStore::open(base.join("embeddings.bin"), b.id(), b.dimensions())
        });

        let verifier = match RemoteJudge::new(&config.verifier.judge) {
            Ok(judge) => Some(Verifier::new(
                Box::new(judge),
                VerdictCache::new(base.join("verify-cache")),
                config.verifier.byte_budget,
                config.verifier.max_attempts,
                config.verifier.base_delay_ms,
            )),
            Err(e) => {
                log::warn!("verification unavailable: {e}");
                None
            }
        };

        Self {
            backend,
            store,
            verifier,
            selector: config.selector.clone(),
            workers: config.verifier.workers.max(1),
        }
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Upsert embeddings for all paths and persist the store. Used by the
    /// `index` command to warm the cache ahead of searches.
    pub fn index(&mut self, paths: &[PathBuf], progress: Option<&ProgressFn>) -> usize {
        let (Some(backend), Some(store)) = (self.backend.as_deref(), self.store.as_mut()) else {
            log::warn!("no embedding backend, nothing to index");
            return 0;
        };

        let reporter = Reporter::new(progress);
        let total = paths.len().max(1);
        refresh_embeddings(backend, store, paths, None, |done| {
            reporter.report((done * 100 / total) as u8, "computing embeddings")
        })
    }

    /// Run one search over an ordered candidate list.
    pub fn search(
        &mut self,
        paths: &[PathBuf],
        query: &str,
        opts: &SearchOptions,
        progress: Option<&ProgressFn>,
        cancel: &CancelToken,
    ) -> Result<SearchOutcome, SearchError> {
        let reporter = Reporter::new(progress);
        let mut outcome = SearchOutcome::default();

        if cancel.is_cancelled() {
            outcome.cancelled = true;
            return Ok(outcome);
        }

        // embedding + ranking, or the degraded no-embedding path
        let ranked: Vec<(PathBuf, f32)> = if let (Some(backend), Some(store)) =
            (self.backend.as_deref(), self.store.as_mut())
        {
            reporter.report(5, "embedding query");
            let query_vector = backend.embed_text(query)?;

            reporter.report(10, "updating embeddings");
            refresh_embeddings(backend, store, paths, Some(cancel), |_| {});
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                return Ok(outcome);
            }

            reporter.report(25, "ranking candidates");
            rank_candidates(&query_vector, store, paths, opts.top_k, &self.selector)?
        } else {
            log::warn!("no embedding backend, verifying first {} candidates", opts.verify_cap);
            outcome.degraded = true;
            paths
                .iter()
                .take(opts.verify_cap)
                .map(|p| (p.clone(), 0.0))
                .collect()
        };

        outcome.cancelled = cancel.is_cancelled();
        let unverified = |(path, score): &(PathBuf, f32)| RankedResult {
            path: path.clone(),
            score: *score,
            embedding_score: *score,
            confidence: None,
        };

        // embedding-only ranking when the judge is off, unreachable, or the
        // search was cancelled before verification started
        let verifier = match &self.verifier {
            Some(v) if opts.verify && !outcome.cancelled => v,
            _ => {
                if !outcome.degraded {
                    outcome.results = ranked.iter().map(unverified).collect();
                }
                reporter.report(100, "done");
                return Ok(outcome);
            }
        };
        outcome.verification_available = true;

        let verify_n = if outcome.degraded {
            opts.verify_cap.min(ranked.len())
        } else {
            opts.verify_top_n.min(ranked.len())
        };

        reporter.report(30, "verifying candidates");
        let verdicts = run_verification_pool(
            verifier,
            &ranked[..verify_n],
            query,
            self.workers,
            cancel,
            &reporter,
        );
        outcome.cancelled = cancel.is_cancelled();

        reporter.report(95, "blending scores");

        // passing candidates blend; failing ones drop; the rest keep their
        // raw embedding score when configured to
        let mut passed: Vec<RankedResult> = Vec::new();
        let mut tail: Vec<RankedResult> = Vec::new();
        for (idx, entry) in ranked.iter().enumerate() {
            match verdicts.get(idx).and_then(|v| v.as_ref()) {
                Some(Ok(v)) if pass_threshold(v.confidence, opts.strictness) => {
                    passed.push(RankedResult {
                        path: entry.0.clone(),
                        score: blend(opts.alpha, v.confidence, entry.1),
                        embedding_score: entry.1,
                        confidence: Some(v.confidence),
                    });
                }
                Some(Ok(_)) => {} // verified and failed: excluded
                Some(Err(e)) => {
                    log::warn!("{}: unverifiable ({e})", entry.0.display());
                    if opts.keep_unverified && !outcome.degraded {
                        tail.push(unverified(entry));
                    }
                }
                // beyond the window, or skipped by cancellation
                None => {
                    if opts.keep_unverified && !outcome.degraded {
                        tail.push(unverified(entry));
                    }
                }
            }
        }

        // blended score descending; ties keep rank order
        passed.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        passed.extend(tail);
        outcome.results = passed;

        reporter.report(100, "done");
        Ok(outcome)
    }
}

/// Upsert every path into the store, then persist it. Returns the number of
/// successful upserts; stops early (but still saves) when cancelled.
fn refresh_embeddings(
    backend: &dyn EmbedBackend,
    store: &mut VectorStore,
    paths: &[PathBuf],
    cancel: Option<&CancelToken>,
    mut on_progress: impl FnMut(usize),
) -> usize {
    let mut updated = 0;
    for (i, path) in paths.iter().enumerate() {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            break;
        }
        match MediaItem::from_path(path) {
            Ok(item) => {
                if store.upsert(&item, backend) {
                    updated += 1;
                }
            }
            Err(e) => log::warn!("skipping {}: {e}", path.display()),
        }
        on_progress(i + 1);
    }
    if let Err(e) = store.save() {
        log::warn!("failed to persist embedding store: {e}");
    }
    updated
}

/// Pre-select and exact-score the stored vectors, keeping the top `top_k`.
fn rank_candidates(
    query: &[f32],
    store: &VectorStore,
    paths: &[PathBuf],
    top_k: usize,
    selector: &SelectorConfig,
) -> Result<Vec<(PathBuf, f32)>, SearchError> {
    // candidates with vectors, in original order
    let mut candidate_paths: Vec<&PathBuf> = Vec::new();
    let mut vectors: Vec<Vec<f32>> = Vec::new();
    for path in paths {
        if let Some(v) = store.get(path) {
            candidate_paths.push(path);
            vectors.push(v.to_vec());
        }
    }

    let selection = select::select(query, &vectors, top_k, selector);
    log::debug!(
        "selector kept {}/{} candidates ({:?})",
        selection.indices.len(),
        vectors.len(),
        selection.mode
    );

    let subset: Vec<Vec<f32>> = selection
        .indices
        .iter()
        .map(|&i| vectors[i].clone())
        .collect();
    let scored = rank::rank(query, &subset)?;

    Ok(scored
        .into_iter()
        .take(top_k)
        .map(|s| (candidate_paths[selection.indices[s.index]].clone(), s.score))
        .collect())
}

/// Verify a window of candidates on a bounded worker pool.
///
/// Workers pull jobs from a shared channel; results travel back tagged with
/// the candidate index, so pool completion order never leaks into result
/// order. The dispatch loop checks the cancellation flag before every send.
fn run_verification_pool(
    verifier: &Verifier,
    window: &[(PathBuf, f32)],
    query: &str,
    workers: usize,
    cancel: &CancelToken,
    reporter: &Reporter<'_>,
) -> Vec<Option<Result<Verdict, VerifyError>>> {
    let mut verdicts: Vec<Option<Result<_, _>>> = Vec::new();
    verdicts.resize_with(window.len(), || None);
    if window.is_empty() {
        return verdicts;
    }

    let width = workers.min(window.len()).max(1);

    let (job_tx, job_rx) = mpsc::channel::<(usize, PathBuf)>();
    let (result_tx, result_rx) = mpsc::channel();
    let job_rx = Arc::new(Mutex::new(job_rx));

    std::thread::scope(|scope| {
        for _ in 0..width {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || loop {
                let job = { job_rx.lock().expect("pool receiver poisoned").recv() };
                let Ok((idx, path)) = job else { break };
                let result = verifier.verify(&path, query);
                if result_tx.send((idx, result)).is_err() {
                    break;
                }
            });
        }
        drop(result_tx);

        let mut dispatched = 0usize;
        for (idx, (path, _)) in window.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if job_tx.send((idx, path.clone())).is_err() {
                break;
            }
            dispatched += 1;
        }
        drop(job_tx);

        for done in 0..dispatched {
            let Ok((idx, result)) = result_rx.recv() else { break };
            if cancel.is_cancelled() {
                // discard completions after cancellation, keep draining so
                // workers shut down cleanly
                continue;
            }
            verdicts[idx] = Some(result);
            let pct = 30 + (((done + 1) * 60) / window.len()) as u8;
            reporter.report(pct, "verifying candidates");
        }
    });

    verdicts
}

/// Wraps the progress callback and enforces monotone percentages.
struct Reporter<'a> {
    callback: Option<&'a ProgressFn>,
    last: std::cell::Cell<u8>,
}

impl<'a> Reporter<'a> {
    fn new(callback: Option<&'a ProgressFn>) -> Self {
        Self {
            callback,
            last: std::cell::Cell::new(0),
        }
    }

    fn report(&self, percent: u8, message: &str) {
        let pct = percent.clamp(self.last.get(), 100);
        self.last.set(pct);
        if let Some(cb) = self.callback {
            cb(pct, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_alpha_one_is_confidence() {
        assert_eq!(blend(1.0, 0.9, 0.4), 0.9);
    }

    #[test]
    fn test_blend_alpha_zero_is_embedding_score() {
        assert_eq!(blend(0.0, 0.9, 0.4), 0.4);
    }

    #[test]
    fn test_blend_default_weighting() {
        let blended = blend(0.7, 0.9, 0.5);
        assert!((blended - (0.7 * 0.9 + 0.3 * 0.5)).abs() < 1e-6);
    }

    #[test]
    fn test_cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.clone().is_cancelled());
    }

    #[test]
    fn test_reporter_is_monotone() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_cb = std::sync::Arc::clone(&seen);
        let cb = move |p: u8, _m: &str| seen_cb.lock().unwrap().push(p);
        let reporter = Reporter::new(Some(&cb));

        reporter.report(10, "a");
        reporter.report(5, "b"); // must not go backwards
        reporter.report(80, "c");

        assert_eq!(*seen.lock().unwrap(), vec![10, 10, 80]);
    }
}
