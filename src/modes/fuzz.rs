//! Coverage-guided fuzzing loop over one API description.
//!
//! Each iteration takes a plan from the corpus, mutates it, sends every call
//! in order, scores the outcomes per operation and keeps the plan when the
//! global coverage vector moved.

use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore as _, SeedableRng as _};
use uuid::Uuid;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::{
    crash_timestamp, init_workspace, render_request, wall_time_iso_utc, ApiSpec, Artifact, ArtifactStore,
    BatchEntry, BatchSummary, BearerToken, CallNode, Config, CoverageScorer, CoverageVector, DependencyFile,
    DependencyResolver, Digest, FuzzSummary, GrammarBuilder, GroupResponseCache, HttpTransport,
    IterationReport, MutationEngine, OperationIndex, OperationLevel, Outcome, RestFuzzError, RestFuzzResult,
    TestPlan, Thresholds, TokenConfig, Transport,
};

pub const CORPUS_DIR: &str = "corpus";
pub const CRASHERS_DIR: &str = "crashers";
pub const TOKEN_FILE: &str = "Token.yml";
pub const DEPENDENCY_FILE: &str = "Dependency.yml";
pub const INFO_FILE: &str = "Info.yml";

/// Per-API directory holding the corpus, crashes and operator files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn for_spec(config: &Config, spec: &ApiSpec) -> Self {
        Self::new(config.workspace_dir(&spec.title))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.root.join(CORPUS_DIR)
    }

    pub fn crashers_dir(&self) -> PathBuf {
        self.root.join(CRASHERS_DIR)
    }

    pub fn token_path(&self) -> PathBuf {
        self.root.join(TOKEN_FILE)
    }

    pub fn dependency_path(&self) -> PathBuf {
        self.root.join(DEPENDENCY_FILE)
    }

    pub fn info_path(&self) -> PathBuf {
        self.root.join(INFO_FILE)
    }

    /// Creates the workspace; `fresh` drops the stored corpus first.
    pub fn prepare(&self, fresh: bool) -> RestFuzzResult<()> {
        std::fs::create_dir_all(&self.root)?;
        let corpus = self.corpus_dir();
        if fresh && corpus.exists() {
            tracing::info!("removing corpus {}", corpus.display());
            std::fs::remove_dir_all(&corpus)?;
        }
        Ok(())
    }

    /// Dependency and token files for strict mode. Missing files are written
    /// from templates and reported as a configuration error to fill them in.
    pub fn load_strict_inputs(&self, spec: &ApiSpec) -> RestFuzzResult<(DependencyFile, TokenConfig)> {
        if !self.dependency_path().exists() || !self.token_path().exists() {
            let report = init_workspace(spec, self)?;
            return Err(RestFuzzError::Config(format!(
                "strict mode needs {DEPENDENCY_FILE} and {TOKEN_FILE}; templates written to {} ({})",
                self.root.display(),
                report.written.join(", ")
            )));
        }
        let deps = DependencyFile::load(&self.dependency_path())?;
        deps.validate(spec)
            .map_err(|e| RestFuzzError::Config(format!("{}: {e}", self.dependency_path().display())))?;
        let token = TokenConfig::load(&self.token_path())?;
        token
            .validate()
            .map_err(|e| RestFuzzError::Config(format!("{}: {e}", self.token_path().display())))?;
        Ok((deps, token))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FuzzOptions {
    pub guided: bool,
    pub strict: bool,
    pub seed: Option<u64>,
    pub runs: Option<u64>,
    pub time: Option<Duration>,
    pub fresh: bool,
}

impl FuzzOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            guided: config.guided,
            strict: config.strict,
            ..Self::default()
        }
    }
}

pub struct Fuzzer<T: Transport> {
    spec: ApiSpec,
    workspace: Workspace,
    base_url: String,
    resolver: DependencyResolver,
    scorer: CoverageScorer,
    engine: MutationEngine,
    corpus: ArtifactStore,
    crashes: ArtifactStore,
    transport: T,
    token: Option<TokenConfig>,
    bearer: Option<BearerToken>,
    timeout: Duration,
    rng: ChaCha20Rng,
    seed: u64,
    guided: bool,
    strict: bool,
    queue: VecDeque<Digest>,
    cache: GroupResponseCache,
    global: CoverageVector,
    iterations: u64,
    improvements: u64,
    crash_count: u64,
    crash_signatures: usize,
}

impl<T: Transport> Fuzzer<T> {
    pub fn new(spec: ApiSpec, workspace: Workspace, config: &Config, opt: &FuzzOptions, transport: T) -> RestFuzzResult<Self> {
        workspace.prepare(opt.fresh)?;
        let (deps, token) = if opt.strict {
            let (deps, token) = workspace.load_strict_inputs(&spec)?;
            (Some(deps), Some(token))
        } else {
            (None, None)
        };
        let base_url = match &config.server {
            Some(server) => server.trim_end_matches('/').to_string(),
            None => spec.server()?,
        };

        let resolver = DependencyResolver::new(&spec, deps.as_ref(), opt.strict)?;
        let index = OperationIndex::new(&spec);
        let global = CoverageVector::zeroed(index.len());
        let scorer = CoverageScorer::new(&spec, index, &resolver, Thresholds::from_config(config))?;
        let seed = opt.seed.unwrap_or_else(gen_seed);

        let corpus = ArtifactStore::open(workspace.corpus_dir());
        let crashes = ArtifactStore::open(workspace.crashers_dir());
        tracing::info!(
            "fuzzing {:?} against {base_url}: {} operations, corpus {}, seed {seed}",
            spec.title,
            spec.operation_count(),
            corpus.len()
        );

        Ok(Self {
            spec,
            workspace,
            base_url,
            resolver,
            scorer,
            engine: MutationEngine::new(config.mutation_picks, config.max_value_bytes),
            corpus,
            crashes,
            transport,
            token,
            bearer: None,
            timeout: Duration::from_millis(config.request_timeout_ms),
            rng: rng_from_seed(seed),
            seed,
            guided: opt.guided,
            strict: opt.strict,
            queue: VecDeque::new(),
            cache: GroupResponseCache::new(),
            global,
            iterations: 0,
            improvements: 0,
            crash_count: 0,
            crash_signatures: 0,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn coverage(&self) -> &CoverageVector {
        &self.global
    }

    pub fn corpus(&self) -> &ArtifactStore {
        &self.corpus
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Seeds an empty corpus with a freshly generated plan.
    pub fn bootstrap(&mut self) -> RestFuzzResult<()> {
        if !self.corpus.is_empty() {
            return Ok(());
        }
        let plan = GrammarBuilder::new(&self.spec, &self.resolver).build();
        tracing::info!("bootstrapping corpus with a {}-node plan", plan.nodes.len());
        self.corpus.add(Artifact::new(plan.to_bytes()?));
        Ok(())
    }

    /// Next plan from the work queue, refilled from the corpus when empty.
    pub fn dequeue(&mut self) -> RestFuzzResult<TestPlan> {
        loop {
            if self.queue.is_empty() {
                self.queue.extend(self.corpus.digests());
            }
            let Some(digest) = self.queue.pop_front() else {
                return Err(RestFuzzError::Data("corpus is empty".to_string()));
            };
            if let Some(artifact) = self.corpus.get(&digest) {
                return TestPlan::from_bytes(&artifact.data);
            }
        }
    }

    pub fn mutate(&mut self, plan: &mut TestPlan) -> RestFuzzResult<()> {
        if self.strict {
            self.refresh_token()?;
        }
        self.engine.mutate(plan, &self.resolver, &self.cache, &mut self.rng)
    }

    fn refresh_token(&mut self) -> RestFuzzResult<()> {
        let Some(token) = &self.token else {
            return Ok(());
        };
        match token.bearer_token(self.timeout) {
            Ok(bearer) => self.bearer = Some(bearer),
            Err(err) if self.bearer.is_some() => {
                tracing::warn!("token refresh failed, keeping previous bearer: {err}");
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Sends every node in order. Later nodes see responses cached from
    /// earlier nodes of the same group.
    pub fn execute(&mut self, plan: &TestPlan) -> RestFuzzResult<Vec<(CallNode, Outcome)>> {
        self.cache.clear();
        let mut executed = Vec::with_capacity(plan.nodes.len());
        for node in &plan.nodes {
            let mut node = node.clone();
            self.resolver.resolve_node(&mut node, &self.cache)?;

            let rendered = render_request(&node, &self.base_url, self.bearer.as_ref());
            let (outcome, request_text) = match &rendered {
                Ok(request) => (self.transport.send(request), request.to_bytes()),
                Err(err) => (
                    Outcome::failure(format!("malformed request for {}: {err}", node.path)),
                    Vec::new(),
                ),
            };
            tracing::debug!("{} {} -> {}", node.method, node.path, outcome.status);

            self.cache
                .record(node.group, &node.path, outcome.status, &outcome.content_type, &outcome.body);
            if outcome.is_server_error() {
                self.archive_crash(&node, &request_text, &outcome)?;
            }
            executed.push((node, outcome));
        }
        Ok(executed)
    }

    fn archive_crash(&mut self, node: &CallNode, request_text: &[u8], outcome: &Outcome) -> RestFuzzResult<()> {
        self.crash_count += 1;
        let key = node.crash_key();
        let key = key.as_bytes();
        let fresh = self
            .crashes
            .add_description(key, outcome.status.to_string().as_bytes(), "code");
        self.crashes.add_description(key, crash_timestamp().as_bytes(), "timestamp");
        self.crashes
            .add_description(key, &serde_json::to_vec_pretty(node)?, "node");
        self.crashes.add_description(key, request_text, "request");
        self.crashes.add_description(key, &outcome.body, "response");
        if fresh {
            self.crash_signatures += 1;
            tracing::warn!(
                "server error {} on {} {} archived as {}",
                outcome.status,
                node.method,
                node.path,
                self.crashes.description_path(key, "code").display()
            );
        }
        Ok(())
    }

    pub fn score(&self, executed: &[(CallNode, Outcome)]) -> CoverageVector {
        self.scorer.score(executed)
    }

    /// Folds an iteration into the global vector; guided mode keeps the plan
    /// when anything improved.
    pub fn persist(&mut self, plan: &TestPlan, vector: &CoverageVector) -> RestFuzzResult<bool> {
        let improved = self.global.merge(vector);
        if improved {
            self.improvements += 1;
            tracing::info!("coverage improved: {}", self.global);
            if self.guided && self.corpus.add(Artifact::new(plan.to_bytes()?)) {
                tracing::debug!("corpus grew to {}", self.corpus.len());
            }
        }
        Ok(improved)
    }

    pub fn run_iteration(&mut self) -> RestFuzzResult<IterationReport> {
        self.bootstrap()?;
        let mut plan = self.dequeue()?;
        self.mutate(&mut plan)?;
        let executed = self.execute(&plan)?;
        let vector = self.score(&executed);
        let improved = self.persist(&plan, &vector)?;
        self.iterations += 1;
        Ok(IterationReport {
            iteration: self.iterations,
            nodes: executed.len(),
            crashes: executed.iter().filter(|(_, o)| o.is_server_error()).count(),
            coverage: vector,
            improved,
        })
    }

    /// Runs until `runs` iterations or `time` elapse (unbounded when neither is set).
    pub fn fuzz(mut self, runs: Option<u64>, time: Option<Duration>) -> RestFuzzResult<FuzzSummary> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = wall_time_iso_utc();
        let started = Instant::now();
        let deadline = time.map(|t| started + t);
        let max_runs = runs.unwrap_or(u64::MAX);

        while self.iterations < max_runs {
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    break;
                }
            }
            self.run_iteration()?;
        }

        let duration_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
        let operations = self
            .scorer
            .index()
            .iter()
            .zip(self.global.levels())
            .map(|((path, method), level)| OperationLevel {
                path: path.to_string(),
                method,
                level: *level,
            })
            .collect();
        let summary = FuzzSummary {
            title: self.spec.title.clone(),
            run_id,
            seed: self.seed,
            guided: self.guided,
            strict: self.strict,
            started_at,
            finished_at: wall_time_iso_utc(),
            duration_ms,
            iterations: self.iterations,
            improvements: self.improvements,
            corpus_size: self.corpus.len(),
            crashes: self.crash_count,
            crash_signatures: self.crash_signatures,
            coverage: self.global.clone(),
            operations,
            workspace_dir: self.workspace.root().display().to_string(),
        };
        summary.write_json(self.workspace.root())?;
        self.corpus.close();
        self.crashes.close();
        Ok(summary)
    }
}

/// Loads one API description and fuzzes it over HTTP.
pub fn fuzz_spec(config: &Config, spec_path: &Path, opt: &FuzzOptions) -> RestFuzzResult<FuzzSummary> {
    let spec = ApiSpec::load(spec_path)?;
    let workspace = Workspace::for_spec(config, &spec);
    let transport = HttpTransport::new(Duration::from_millis(config.request_timeout_ms));
    Fuzzer::new(spec, workspace, config, opt, transport)?.fuzz(opt.runs, opt.time)
}

/// Fuzzes each API description in turn; a failing one is recorded and skipped.
pub fn fuzz_specs(config: &Config, specs: &[PathBuf], opt: &FuzzOptions) -> BatchSummary {
    let mut batch = BatchSummary::default();
    for path in specs {
        let spec = path.display().to_string();
        match fuzz_spec(config, path, opt) {
            Ok(summary) => batch.entries.push(BatchEntry {
                spec,
                summary: Some(summary),
                error: None,
            }),
            Err(err) => {
                tracing::error!("fuzzing {spec} failed: {err}");
                batch.entries.push(BatchEntry {
                    spec,
                    summary: None,
                    error: Some(err.to_string()),
                });
            }
        }
    }
    batch
}

pub fn gen_seed() -> u64 {
    let mut seed = [0u8; 8];
    rand_core::OsRng.fill_bytes(&mut seed);
    u64::from_le_bytes(seed)
}

pub fn rng_from_seed(seed: u64) -> ChaCha20Rng {
    let seed_bytes = blake3::hash(&seed.to_le_bytes()).as_bytes().to_owned();
    let mut seed32 = [0u8; 32];
    seed32.copy_from_slice(&seed_bytes[..32]);
    ChaCha20Rng::from_seed(seed32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Method, RenderedRequest};
    use rand_core::RngCore as _;

    struct Scripted {
        status: u16,
        sent: Vec<RenderedRequest>,
    }

    impl Transport for Scripted {
        fn send(&mut self, request: &RenderedRequest) -> Outcome {
            self.sent.push(request.clone());
            Outcome {
                status: self.status,
                content_type: "application/json".to_string(),
                body: br#"{"id": 1}"#.to_vec(),
                error: None,
            }
        }
    }

    fn spec() -> ApiSpec {
        ApiSpec::from_document(&serde_json::json!({
            "openapi": "3.0.0",
            "info": {"title": "Loop"},
            "servers": [{"url": "http://api.test"}],
            "paths": {
                "/things": {
                    "post": {
                        "requestBody": {"content": {"application/json": {"example": {"name": "a", "size": 1}}}},
                        "responses": {"201": {"content": {"application/json": {"example": {"id": 1}}}}}
                    }
                }
            }
        }))
        .expect("spec")
    }

    fn config(name: &str) -> Config {
        Config {
            base_dir: std::env::temp_dir().join(format!("restfuzz-loop-{name}-{}", uuid::Uuid::new_v4())),
            ..Config::default()
        }
    }

    fn fuzzer(cfg: &Config, status: u16, opt: &FuzzOptions) -> Fuzzer<Scripted> {
        let spec = spec();
        let ws = Workspace::for_spec(cfg, &spec);
        let transport = Scripted { status, sent: Vec::new() };
        Fuzzer::new(spec, ws, cfg, opt, transport).expect("fuzzer")
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let mut a = rng_from_seed(42);
        let mut b = rng_from_seed(42);
        assert_eq!(a.next_u64(), b.next_u64());
        assert_ne!(rng_from_seed(1).next_u64(), rng_from_seed(2).next_u64());
    }

    #[test]
    fn first_iteration_bootstraps_and_improves() {
        let cfg = config("first");
        let opt = FuzzOptions {
            guided: true,
            seed: Some(1),
            ..FuzzOptions::default()
        };
        let mut f = fuzzer(&cfg, 201, &opt);
        let report = f.run_iteration().expect("iteration");
        assert_eq!(report.nodes, 1);
        assert!(report.improved);
        assert!(report.coverage.levels()[0] >= 2);
        assert!(!f.corpus().is_empty());
        assert_eq!(f.transport.sent[0].method, Method::Post);
        assert_eq!(f.transport.sent[0].url, "http://api.test/things");
    }

    #[test]
    fn non_guided_mode_never_grows_the_corpus() {
        let cfg = config("unguided");
        let opt = FuzzOptions {
            guided: false,
            seed: Some(3),
            ..FuzzOptions::default()
        };
        let mut f = fuzzer(&cfg, 201, &opt);
        for _ in 0..10 {
            f.run_iteration().expect("iteration");
        }
        assert_eq!(f.corpus().len(), 1);
    }

    #[test]
    fn coverage_never_regresses() {
        let cfg = config("monotonic");
        let opt = FuzzOptions {
            guided: true,
            seed: Some(5),
            ..FuzzOptions::default()
        };
        let mut f = fuzzer(&cfg, 201, &opt);
        let mut last = f.coverage().clone();
        for _ in 0..20 {
            f.run_iteration().expect("iteration");
            let now = f.coverage().clone();
            assert!(now.levels().iter().zip(last.levels()).all(|(n, l)| n >= l));
            last = now;
        }
    }

    #[test]
    fn server_errors_are_archived_with_five_descriptions() {
        let cfg = config("crash");
        let opt = FuzzOptions {
            guided: true,
            seed: Some(9),
            runs: Some(2),
            ..FuzzOptions::default()
        };
        let f = fuzzer(&cfg, 503, &opt);
        let crashers = f.workspace().crashers_dir();
        let summary = f.fuzz(opt.runs, None).expect("fuzz");
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.crashes, 2);
        assert_eq!(summary.crash_signatures, 1);

        let mut kinds: Vec<String> = std::fs::read_dir(&crashers)
            .expect("crashers")
            .map(|e| e.expect("entry").path())
            .filter_map(|p| p.extension().map(|e| e.to_string_lossy().to_string()))
            .collect();
        kinds.sort();
        assert_eq!(kinds, vec!["code", "node", "request", "response", "timestamp"]);
        let sig = blake3::hash(b"/thingsapplication/json").to_hex().to_string();
        assert_eq!(std::fs::read_to_string(crashers.join(format!("{sig}.code"))).expect("code"), "503");
    }

    #[test]
    fn transport_failures_are_not_archived() {
        let cfg = config("unreachable");
        let opt = FuzzOptions {
            seed: Some(4),
            ..FuzzOptions::default()
        };
        let mut f = fuzzer(&cfg, crate::TRANSPORT_FAILURE, &opt);
        let report = f.run_iteration().expect("iteration");
        assert_eq!(report.crashes, 0);
        assert!(std::fs::read_dir(f.workspace().crashers_dir()).expect("dir").next().is_none());
    }

    #[test]
    fn corrupt_stored_plan_is_fatal() {
        let cfg = config("corrupt");
        let spec = spec();
        let ws = Workspace::for_spec(&cfg, &spec);
        std::fs::create_dir_all(ws.corpus_dir()).expect("corpus dir");
        std::fs::write(ws.corpus_dir().join("seed.bin"), b"\xffnot a plan").expect("seed");
        let opt = FuzzOptions::default();
        let mut f = Fuzzer::new(spec, ws, &cfg, &opt, Scripted { status: 200, sent: Vec::new() }).expect("fuzzer");
        let err = f.run_iteration().expect_err("must fail");
        assert!(matches!(err, RestFuzzError::Data(_)));
    }

    #[test]
    fn strict_mode_without_files_writes_templates() {
        let cfg = config("strict");
        let spec = spec();
        let ws = Workspace::for_spec(&cfg, &spec);
        let opt = FuzzOptions {
            strict: true,
            ..FuzzOptions::default()
        };
        let err = Fuzzer::new(spec, ws.clone(), &cfg, &opt, Scripted { status: 200, sent: Vec::new() })
            .err()
            .expect("must fail");
        assert!(matches!(err, RestFuzzError::Config(_)));
        assert!(ws.dependency_path().exists());
        assert!(ws.token_path().exists());
    }

    #[test]
    fn fresh_removes_the_corpus() {
        let cfg = config("fresh");
        let opt = FuzzOptions {
            seed: Some(2),
            ..FuzzOptions::default()
        };
        let mut f = fuzzer(&cfg, 201, &opt);
        f.run_iteration().expect("iteration");
        drop(f);

        let again = fuzzer(&cfg, 201, &opt);
        assert!(!again.corpus().is_empty());

        let fresh = FuzzOptions {
            fresh: true,
            ..opt
        };
        let f = fuzzer(&cfg, 201, &fresh);
        assert!(f.corpus().is_empty());
    }
}
