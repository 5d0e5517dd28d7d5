//! Git operations on project checkouts through libgit2

use std::cell::Cell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    Cred, CredentialType, Direction, ErrorClass, ErrorCode, FetchOptions, Oid, Remote,
    RemoteCallbacks, Repository, ResetType,
};
use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::project::GitAuth;
use crate::utils::redact_url;

/// Credential callbacks are retried by libgit2; give up after this many
const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Classified Git failures. The messages are meant for end users.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GitError {
    #[error("Repository requires authentication")]
    AuthenticationRequired,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Repository not found")]
    RepositoryNotFound,

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Network error while contacting the repository")]
    Network,

    #[error("Git operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Git error: {0}")]
    Other(String),
}

/// Git client configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GitOptions {
    /// Limit for every network operation
    pub timeout: Duration,
}

impl Default for GitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

/// Repository access used by the project manager
#[async_trait]
pub trait GitClient: Send + Sync {
    /// Shallow single-branch clone of `branch` into `dest`
    async fn clone_repo(
        &self,
        url: &str,
        branch: &str,
        auth: Option<&GitAuth>,
        dest: &Path,
    ) -> Result<(), GitError>;

    /// Bring the checkout to the remote tip of `branch`, discarding local
    /// history when the remote was force-pushed. Returns the new head.
    async fn pull(&self, dir: &Path, branch: &str, auth: Option<&GitAuth>)
        -> Result<String, GitError>;

    /// Update `refs/remotes/origin/<branch>` without touching the checkout
    async fn fetch(&self, dir: &Path, branch: &str, auth: Option<&GitAuth>)
        -> Result<(), GitError>;

    /// Commit checked out at `HEAD`
    async fn local_commit(&self, dir: &Path) -> Result<String, GitError>;

    /// Last fetched commit of `branch`
    async fn remote_commit(&self, dir: &Path, branch: &str) -> Result<String, GitError>;

    /// Branch the remote `HEAD` points to
    async fn default_branch(&self, url: &str, auth: Option<&GitAuth>) -> Result<String, GitError>;

    /// Connect and list refs
    async fn test_authentication(&self, url: &str, auth: Option<&GitAuth>)
        -> Result<(), GitError>;
}

/// [`GitClient`] on top of libgit2
#[derive(Debug, Clone, Default)]
pub struct Git2Client {
    options: GitOptions,
}

impl Git2Client {
    pub fn new(options: GitOptions) -> Self {
        Self { options }
    }

    /// Run `op` on the blocking pool. When the timeout passes the abort flag is
    /// raised so an in-flight transfer stops at its next progress callback.
    async fn run_blocking<T, F>(&self, what: &'static str, op: F) -> Result<T, GitError>
    where
        T: Send + 'static,
        F: FnOnce(&AtomicBool) -> Result<T, GitError> + Send + 'static,
    {
        let abort = Arc::new(AtomicBool::new(false));
        let flag = abort.clone();
        let handle = tokio::task::spawn_blocking(move || op(&flag));

        match tokio::time::timeout(self.options.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(GitError::Other(format!("{what} task failed: {e}"))),
            Err(_) => {
                abort.store(true, Ordering::Relaxed);
                warn!("git {} timed out after {:?}", what, self.options.timeout);
                Err(GitError::Timeout(self.options.timeout))
            }
        }
    }
}

#[async_trait]
impl GitClient for Git2Client {
    async fn clone_repo(
        &self,
        url: &str,
        branch: &str,
        auth: Option<&GitAuth>,
        dest: &Path,
    ) -> Result<(), GitError> {
        info!("Cloning {} (branch {}) into {:?}", redact_url(url), branch, dest);
        let url = url.to_string();
        let branch = branch.to_string();
        let auth = auth.cloned();
        let dest = dest.to_path_buf();

        self.run_blocking("clone", move |abort| {
            let session = AuthSession::new(auth.as_ref());
            let mut fetch = FetchOptions::new();
            fetch.remote_callbacks(session.callbacks(abort));
            if !is_local(&url) {
                fetch.depth(1);
            }

            let refspec = branch_refspec(&branch);
            let cloned = RepoBuilder::new()
                .branch(&branch)
                .fetch_options(fetch)
                .remote_create(|repo: &Repository, name: &str, url: &str| {
                    repo.remote_with_fetch(name, url, &refspec)
                })
                .clone(&url, &dest);
            cloned
                .map(|_| ())
                .map_err(|e| session.classify(e, Some(&branch)))
        })
        .await
    }

    async fn pull(
        &self,
        dir: &Path,
        branch: &str,
        auth: Option<&GitAuth>,
    ) -> Result<String, GitError> {
        let dir = dir.to_path_buf();
        let branch = branch.to_string();
        let auth = auth.cloned();

        self.run_blocking("pull", move |abort| {
            let repo = open(&dir)?;
            let session = AuthSession::new(auth.as_ref());
            fetch_branch(&repo, &branch, &session, abort)?;

            let remote_tip = tracking_oid(&repo, &branch)?;
            let local_head = repo.head().ok().and_then(|h| h.target());
            if local_head == Some(remote_tip) && head_is_branch(&repo, &branch) {
                debug!("{:?} already at {}", dir, remote_tip);
                return Ok(remote_tip.to_string());
            }

            if let Some(local) = local_head {
                let descends = repo.graph_descendant_of(remote_tip, local).unwrap_or(false);
                if !descends && local != remote_tip {
                    warn!(
                        "Remote branch {} no longer contains {}, resetting to {}",
                        branch, local, remote_tip
                    );
                }
            }

            reset_to(&repo, &branch, remote_tip).map_err(|e| session.classify(e, Some(&branch)))?;
            info!("Updated {:?} to {}", dir, remote_tip);
            Ok(remote_tip.to_string())
        })
        .await
    }

    async fn fetch(
        &self,
        dir: &Path,
        branch: &str,
        auth: Option<&GitAuth>,
    ) -> Result<(), GitError> {
        let dir = dir.to_path_buf();
        let branch = branch.to_string();
        let auth = auth.cloned();

        self.run_blocking("fetch", move |abort| {
            let repo = open(&dir)?;
            let session = AuthSession::new(auth.as_ref());
            fetch_branch(&repo, &branch, &session, abort)?;
            tracking_oid(&repo, &branch).map(|_| ())
        })
        .await
    }

    async fn local_commit(&self, dir: &Path) -> Result<String, GitError> {
        let dir = dir.to_path_buf();
        self.run_blocking("rev-parse", move |_| {
            let repo = open(&dir)?;
            let commit = repo
                .head()
                .and_then(|head| head.peel_to_commit())
                .map_err(|e| GitError::Other(e.message().to_string()))?;
            Ok(commit.id().to_string())
        })
        .await
    }

    async fn remote_commit(&self, dir: &Path, branch: &str) -> Result<String, GitError> {
        let dir = dir.to_path_buf();
        let branch = branch.to_string();
        self.run_blocking("rev-parse", move |_| {
            let repo = open(&dir)?;
            tracking_oid(&repo, &branch).map(|oid| oid.to_string())
        })
        .await
    }

    async fn default_branch(&self, url: &str, auth: Option<&GitAuth>) -> Result<String, GitError> {
        let url = url.to_string();
        let auth = auth.cloned();

        self.run_blocking("ls-remote", move |abort| {
            let session = AuthSession::new(auth.as_ref());
            let mut remote =
                Remote::create_detached(url.as_str()).map_err(|e| session.classify(e, None))?;
            let mut connection = remote
                .connect_auth(Direction::Fetch, Some(session.callbacks(abort)), None)
                .map_err(|e| session.classify(e, None))?;
            let head = connection
                .remote()
                .default_branch()
                .map_err(|e| session.classify(e, None))?;

            let head = head
                .as_str()
                .ok_or_else(|| GitError::Other("remote HEAD is not valid UTF-8".to_string()))?;
            let branch = head.strip_prefix("refs/heads/").unwrap_or(head).to_string();
            debug!("Default branch of {} is {}", redact_url(&url), branch);
            Ok(branch)
        })
        .await
    }

    async fn test_authentication(
        &self,
        url: &str,
        auth: Option<&GitAuth>,
    ) -> Result<(), GitError> {
        let url = url.to_string();
        let auth = auth.cloned();

        self.run_blocking("ls-remote", move |abort| {
            let session = AuthSession::new(auth.as_ref());
            let mut remote =
                Remote::create_detached(url.as_str()).map_err(|e| session.classify(e, None))?;
            let mut connection = remote
                .connect_auth(Direction::Fetch, Some(session.callbacks(abort)), None)
                .map_err(|e| session.classify(e, None))?;
            let refs = connection
                .remote()
                .list()
                .map_err(|e| session.classify(e, None))?
                .len();
            debug!("{} advertises {} refs", redact_url(&url), refs);
            Ok(())
        })
        .await
    }
}

fn branch_refspec(branch: &str) -> String {
    format!("+refs/heads/{branch}:refs/remotes/origin/{branch}")
}

/// libgit2's local transport cannot do shallow fetches
fn is_local(url: &str) -> bool {
    url.starts_with("file://")
        || url.starts_with('/')
        || url.starts_with('.')
        || Path::new(url).exists()
}

fn open(dir: &Path) -> Result<Repository, GitError> {
    Repository::open(dir).map_err(|e| {
        GitError::Other(format!("cannot open checkout {:?}: {}", dir, e.message()))
    })
}

fn fetch_branch(
    repo: &Repository,
    branch: &str,
    session: &AuthSession<'_>,
    abort: &AtomicBool,
) -> Result<(), GitError> {
    let mut remote = repo
        .find_remote("origin")
        .map_err(|e| GitError::Other(e.message().to_string()))?;
    let shallow = remote.url().is_some_and(|url| !is_local(url));

    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(session.callbacks(abort));
    if shallow {
        fetch.depth(1);
    }

    remote
        .fetch(&[branch_refspec(branch)], Some(&mut fetch), None)
        .map_err(|e| session.classify(e, Some(branch)))
}

fn tracking_oid(repo: &Repository, branch: &str) -> Result<Oid, GitError> {
    repo.find_reference(&format!("refs/remotes/origin/{branch}"))
        .ok()
        .and_then(|reference| reference.target())
        .ok_or_else(|| GitError::BranchNotFound(branch.to_string()))
}

fn head_is_branch(repo: &Repository, branch: &str) -> bool {
    repo.head()
        .ok()
        .and_then(|head| head.name().map(|name| name == format!("refs/heads/{branch}")))
        .unwrap_or(false)
}

/// Point `refs/heads/<branch>` at `target`, check it out and reset hard
fn reset_to(repo: &Repository, branch: &str, target: Oid) -> Result<(), git2::Error> {
    let local_ref = format!("refs/heads/{branch}");
    repo.reference(&local_ref, target, true, "stackd: reset to remote tip")?;
    repo.set_head(&local_ref)?;

    let object = repo.find_object(target, None)?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force().remove_untracked(true);
    repo.reset(&object, ResetType::Hard, Some(&mut checkout))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthFailure {
    Required,
    Rejected,
}

/// Credential state for one libgit2 operation
struct AuthSession<'a> {
    auth: Option<&'a GitAuth>,
    attempts: Cell<u32>,
    failure: Cell<Option<AuthFailure>>,
}

impl<'a> AuthSession<'a> {
    fn new(auth: Option<&'a GitAuth>) -> Self {
        Self {
            auth,
            attempts: Cell::new(0),
            failure: Cell::new(None),
        }
    }

    fn callbacks<'s>(&'s self, abort: &'s AtomicBool) -> RemoteCallbacks<'s> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, allowed| {
            self.credentials(username_from_url, allowed)
        });
        callbacks.transfer_progress(move |_| !abort.load(Ordering::Relaxed));
        callbacks.sideband_progress(move |_| !abort.load(Ordering::Relaxed));
        callbacks
    }

    fn credentials(
        &self,
        username_from_url: Option<&str>,
        allowed: CredentialType,
    ) -> Result<Cred, git2::Error> {
        let Some(auth) = self.auth else {
            self.failure.set(Some(AuthFailure::Required));
            return Err(git2::Error::from_str("no credentials configured"));
        };

        let attempt = self.attempts.get() + 1;
        self.attempts.set(attempt);
        if attempt > MAX_AUTH_ATTEMPTS {
            self.failure.set(Some(AuthFailure::Rejected));
            return Err(git2::Error::from_str("credentials rejected"));
        }

        match auth {
            GitAuth::Http { username, password }
                if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) =>
            {
                Cred::userpass_plaintext(username, password.expose_secret())
            }
            GitAuth::Ssh { user, .. } if allowed.contains(CredentialType::USERNAME) => {
                Cred::username(username_from_url.unwrap_or(user.as_str()))
            }
            GitAuth::Ssh {
                private_key,
                passphrase,
                user,
            } if allowed.contains(CredentialType::SSH_KEY) => Cred::ssh_key_from_memory(
                username_from_url.unwrap_or(user.as_str()),
                None,
                private_key.expose_secret(),
                passphrase.as_ref().map(|p| p.expose_secret()),
            ),
            _ => {
                self.failure.set(Some(AuthFailure::Rejected));
                Err(git2::Error::from_str(
                    "configured credentials do not match what the remote accepts",
                ))
            }
        }
    }

    /// Map a libgit2 failure onto [`GitError`]. `branch` is set when the
    /// operation targeted a specific branch.
    fn classify(&self, err: git2::Error, branch: Option<&str>) -> GitError {
        debug!("libgit2 error ({:?}/{:?}): {}", err.class(), err.code(), err.message());

        match self.failure.get() {
            Some(AuthFailure::Required) => return GitError::AuthenticationRequired,
            Some(AuthFailure::Rejected) => return GitError::AuthenticationFailed,
            None => {}
        }

        let message = err.message().to_lowercase();
        if err.code() == ErrorCode::Auth
            || message.contains("authentication")
            || message.contains("401")
            || message.contains("403")
        {
            return if self.auth.is_some() {
                GitError::AuthenticationFailed
            } else {
                GitError::AuthenticationRequired
            };
        }

        if let Some(branch) = branch {
            if err.class() == ErrorClass::Reference && err.code() == ErrorCode::NotFound
                || message.contains("couldn't find remote ref")
                || (message.contains("not found") && message.contains(&branch.to_lowercase()))
            {
                return GitError::BranchNotFound(branch.to_string());
            }
        }

        if message.contains("404")
            || message.contains("repository not found")
            || message.contains("could not find repository")
            || message.contains("does not appear to be a git repository")
            || (err.code() == ErrorCode::NotFound
                && matches!(err.class(), ErrorClass::Os | ErrorClass::Repository))
        {
            return GitError::RepositoryNotFound;
        }

        match err.class() {
            ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh | ErrorClass::Ssl => {
                GitError::Network
            }
            _ => GitError::Other(err.message().to_string()),
        }
    }
}
