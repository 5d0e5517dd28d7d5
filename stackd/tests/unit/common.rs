//! Test doubles shared by the unit test suite

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use stackd::crypto::cipher::AesGcmCipher;
use stackd::deploy::cancel::CancelToken;
use stackd::deploy::compose::{ComposeAction, ComposeError, ComposeProject, ComposeRunner};
use stackd::deploy::git::{GitClient, GitError};
use stackd::deploy::manager::{CommandTimeouts, ProjectManager};
use stackd::deploy::process::{CommandOutput, OutputLine, OutputSink, OutputStream};
use stackd::errors::StackError;
use stackd::models::deployment::Deployment;
use stackd::models::project::{GitAuth, NewProject, Project};
use stackd::storage::layout::StorageLayout;
use stackd::store::json::JsonStore;
use stackd::store::Persistence;

pub const FIRST_COMMIT: &str = "1111111111111111111111111111111111111111";
pub const SECOND_COMMIT: &str = "2222222222222222222222222222222222222222";

pub const RUNNING_PS: &str =
    r#"{"Service":"web","Name":"web-1","State":"running","Status":"Up 1 minute","RunningFor":"1 minute ago"}"#;
pub const PARTIAL_PS: &str = r#"[{"Service":"web","State":"running"},{"Service":"db","State":"exited"}]"#;

// ==================================== GIT ======================================== //

struct GitState {
    /// branch -> head commit on the remote
    branches: HashMap<String, String>,
    default_branch: String,
    checkouts: HashMap<PathBuf, String>,
    fetched: HashMap<PathBuf, String>,
    auth_error: Option<GitError>,
}

/// Remote repository kept in memory. Clones create the checkout directory so
/// the manager sees it on disk.
pub struct FakeGit {
    state: Mutex<GitState>,
}

impl FakeGit {
    pub fn new() -> Self {
        let mut branches = HashMap::new();
        branches.insert("main".to_string(), FIRST_COMMIT.to_string());
        Self {
            state: Mutex::new(GitState {
                branches,
                default_branch: "main".to_string(),
                checkouts: HashMap::new(),
                fetched: HashMap::new(),
                auth_error: None,
            }),
        }
    }

    /// Move `branch` to `commit` on the remote
    pub fn push(&self, branch: &str, commit: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .branches
            .insert(branch.to_string(), commit.to_string());
    }

    pub fn delete_branch(&self, branch: &str) {
        self.state.lock().unwrap().branches.remove(branch);
    }

    pub fn fail_auth(&self, error: GitError) {
        self.state.lock().unwrap().auth_error = Some(error);
    }

    fn head(&self, branch: &str) -> Result<String, GitError> {
        let state = self.state.lock().unwrap();
        if let Some(error) = &state.auth_error {
            return Err(error.clone());
        }
        state
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| GitError::BranchNotFound(branch.to_string()))
    }
}

#[async_trait]
impl GitClient for FakeGit {
    async fn clone_repo(
        &self,
        _url: &str,
        branch: &str,
        _auth: Option<&GitAuth>,
        dest: &Path,
    ) -> Result<(), GitError> {
        let head = self.head(branch)?;
        std::fs::create_dir_all(dest).map_err(|e| GitError::Other(e.to_string()))?;
        let mut state = self.state.lock().unwrap();
        state.checkouts.insert(dest.to_path_buf(), head.clone());
        state.fetched.insert(dest.to_path_buf(), head);
        Ok(())
    }

    async fn pull(
        &self,
        dir: &Path,
        branch: &str,
        _auth: Option<&GitAuth>,
    ) -> Result<String, GitError> {
        let head = self.head(branch)?;
        let mut state = self.state.lock().unwrap();
        state.checkouts.insert(dir.to_path_buf(), head.clone());
        state.fetched.insert(dir.to_path_buf(), head.clone());
        Ok(head)
    }

    async fn fetch(
        &self,
        dir: &Path,
        branch: &str,
        _auth: Option<&GitAuth>,
    ) -> Result<(), GitError> {
        let head = self.head(branch)?;
        self.state
            .lock()
            .unwrap()
            .fetched
            .insert(dir.to_path_buf(), head);
        Ok(())
    }

    async fn local_commit(&self, dir: &Path) -> Result<String, GitError> {
        self.state
            .lock()
            .unwrap()
            .checkouts
            .get(dir)
            .cloned()
            .ok_or_else(|| GitError::Other(format!("not a repository: {}", dir.display())))
    }

    async fn remote_commit(&self, dir: &Path, branch: &str) -> Result<String, GitError> {
        self.state
            .lock()
            .unwrap()
            .fetched
            .get(dir)
            .cloned()
            .ok_or_else(|| GitError::BranchNotFound(branch.to_string()))
    }

    async fn default_branch(&self, _url: &str, _auth: Option<&GitAuth>) -> Result<String, GitError> {
        let state = self.state.lock().unwrap();
        match &state.auth_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.default_branch.clone()),
        }
    }

    async fn test_authentication(
        &self,
        _url: &str,
        _auth: Option<&GitAuth>,
    ) -> Result<(), GitError> {
        match &self.state.lock().unwrap().auth_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

// ================================== COMPOSE ====================================== //

#[derive(Clone)]
struct ComposeState {
    calls: Vec<ComposeAction>,
    up_fails: bool,
    hang: bool,
    ps_hang: bool,
    ps: Result<String, String>,
    lines: Vec<String>,
}

/// Compose engine double. `up` and following `logs` print the configured
/// lines; a hanging engine only returns once cancelled.
pub struct FakeCompose {
    state: Mutex<ComposeState>,
}

impl FakeCompose {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ComposeState {
                calls: Vec::new(),
                up_fails: false,
                hang: false,
                ps_hang: false,
                ps: Ok(String::new()),
                lines: vec!["Container web-1 Started".to_string()],
            }),
        }
    }

    pub fn set_up_fails(&self, fails: bool) {
        self.state.lock().unwrap().up_fails = fails;
    }

    pub fn set_hang(&self, hang: bool) {
        self.state.lock().unwrap().hang = hang;
    }

    /// Make `ps` block until its token fires
    pub fn set_ps_hang(&self, hang: bool) {
        self.state.lock().unwrap().ps_hang = hang;
    }

    pub fn set_ps(&self, output: &str) {
        self.state.lock().unwrap().ps = Ok(output.to_string());
    }

    pub fn set_ps_error(&self, message: &str) {
        self.state.lock().unwrap().ps = Err(message.to_string());
    }

    pub fn set_lines(&self, lines: &[&str]) {
        self.state.lock().unwrap().lines = lines.iter().map(|l| l.to_string()).collect();
    }

    pub fn calls(&self) -> Vec<ComposeAction> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&ComposeAction) -> bool) -> usize {
        self.calls().iter().filter(|a| matches(a)).count()
    }
}

async fn emit(sink: &OutputSink, lines: &[String]) -> String {
    let mut captured = String::new();
    for line in lines {
        if let OutputSink::Channel(tx) = sink {
            let _ = tx
                .send(OutputLine {
                    stream: OutputStream::Stdout,
                    line: line.clone(),
                })
                .await;
        }
        captured.push_str(line);
        captured.push('\n');
    }
    captured
}

#[async_trait]
impl ComposeRunner for FakeCompose {
    async fn run(
        &self,
        _project: &ComposeProject,
        action: &ComposeAction,
        sink: OutputSink,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, ComposeError> {
        let state = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(action.clone());
            state.clone()
        };

        let following = matches!(action, ComposeAction::Logs { follow: true, .. });
        match action {
            ComposeAction::Up | ComposeAction::Logs { .. } => {
                let stdout = emit(&sink, &state.lines).await;
                if state.hang || following {
                    let reason = cancel.cancelled().await;
                    return Err(ComposeError::Cancelled {
                        reason,
                        stdout,
                        stderr: String::new(),
                    });
                }
                if state.up_fails && matches!(action, ComposeAction::Up) {
                    return Err(ComposeError::Failed {
                        code: Some(1),
                        stdout,
                        stderr: "image not found".to_string(),
                    });
                }
                Ok(CommandOutput {
                    code: Some(0),
                    stdout,
                    stderr: String::new(),
                })
            }
            ComposeAction::Ps if state.ps_hang => Err(ComposeError::Cancelled {
                reason: cancel.cancelled().await,
                stdout: String::new(),
                stderr: String::new(),
            }),
            ComposeAction::Ps => match state.ps {
                Ok(stdout) => Ok(CommandOutput {
                    code: Some(0),
                    stdout,
                    stderr: String::new(),
                }),
                Err(message) => Err(ComposeError::Spawn {
                    program: "docker".to_string(),
                    message,
                }),
            },
            ComposeAction::Config => Ok(CommandOutput {
                code: Some(0),
                stdout: "services:\n  web:\n    image: nginx\n".to_string(),
                stderr: String::new(),
            }),
            ComposeAction::Down { .. } => Ok(CommandOutput::default()),
        }
    }
}

// =================================== STORE ======================================= //

/// Counts writes going to the wrapped store
pub struct CountingStore {
    inner: JsonStore,
    writes: AtomicUsize,
}

impl CountingStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Persistence for CountingStore {
    async fn create_project(&self, project: &Project) -> Result<(), StackError> {
        self.count();
        self.inner.create_project(project).await
    }

    async fn update_project(&self, project: &Project) -> Result<(), StackError> {
        self.count();
        self.inner.update_project(project).await
    }

    async fn delete_project(&self, id: &str) -> Result<(), StackError> {
        self.count();
        self.inner.delete_project(id).await
    }

    async fn find_project(&self, id: &str) -> Result<Option<Project>, StackError> {
        self.inner.find_project(id).await
    }

    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>, StackError> {
        self.inner.find_project_by_name(name).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StackError> {
        self.inner.list_projects().await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), StackError> {
        self.count();
        self.inner.create_deployment(deployment).await
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), StackError> {
        self.count();
        self.inner.update_deployment(deployment).await
    }

    async fn find_deployment(&self, id: &str) -> Result<Option<Deployment>, StackError> {
        self.inner.find_deployment(id).await
    }

    async fn list_deployments(&self, project_id: &str) -> Result<Vec<Deployment>, StackError> {
        self.inner.list_deployments(project_id).await
    }
}

// ================================== HARNESS ====================================== //

pub struct Harness {
    pub manager: Arc<ProjectManager>,
    pub git: Arc<FakeGit>,
    pub compose: Arc<FakeCompose>,
    pub store: Arc<CountingStore>,
    pub layout: StorageLayout,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_timeouts(CommandTimeouts::default()).await
    }

    pub async fn with_timeouts(timeouts: CommandTimeouts) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout.setup().await.unwrap();

        let cipher = Arc::new(AesGcmCipher::from_secret(b"stackd-tests"));
        let store = Arc::new(CountingStore {
            inner: JsonStore::open(&layout.state_dir(), cipher).await.unwrap(),
            writes: AtomicUsize::new(0),
        });
        let git = Arc::new(FakeGit::new());
        let compose = Arc::new(FakeCompose::new());
        let manager = Arc::new(ProjectManager::new(
            store.clone(),
            git.clone(),
            compose.clone(),
            layout.clone(),
            timeouts,
        ));

        Self {
            manager,
            git,
            compose,
            store,
            layout,
            _dir: dir,
        }
    }

    /// Create a project tracking the default branch
    pub async fn create(&self, name: &str) -> Project {
        self.manager.create(new_project(name)).await.unwrap()
    }
}

pub fn new_project(name: &str) -> NewProject {
    NewProject {
        name: name.to_string(),
        git_url: format!("https://git.example.com/org/{name}.git"),
        git_branch: String::new(),
        git_auth: None,
        compose_files: vec!["compose.yml".to_string()],
        variables: vec!["PORT=8080".to_string()],
        watch_enabled: true,
    }
}

/// Wait until `condition` holds, polling the fakes
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
