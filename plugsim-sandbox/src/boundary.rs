//! Disposable execution domain for extension code.
//!
//! An `IsolationBoundary` owns:
//! - A permission profile every caller is checked against
//! - The set of verified components granted full trust
//! - Resource ceilings for its worker processes
//! - Domain-scoped statics, the only state extension code may keep between
//!   invocations
//!
//! A `Worker` domain runs every invocation in a forked worker process (see
//! `worker.rs`): process-wide statics, threads and descriptors the entry
//! point creates die with the worker, and the kernel enforces the
//! capability profile. An `InProcess` domain runs the entry point on the
//! caller's thread and is meant for host code that runs with full trust.
//!
//! Either way arguments and results cross the boundary as JSON and panics
//! are contained. Disposing the boundary drops all domain state at once,
//! terminates any live worker, and every later `run` fails with `Disposed`.

use crate::error::{BoundaryError, HandlerPanic};
use crate::identity::{ComponentIdentity, IdentityVerifier, StrongName};
use crate::permissions::{Permission, PermissionSet};
use crate::policy::{ResourceLimits, SandboxPolicy};
use crate::worker;
use anyhow::anyhow;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where a domain runs its entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    /// On the caller's thread.
    InProcess,
    /// In a forked worker process per invocation.
    Worker,
}

pub(crate) struct Domain {
    pub(crate) id: Uuid,
    pub(crate) name: String,
    pub(crate) kind: DomainKind,
    pub(crate) profile: PermissionSet,
    /// Verified full-trust components, keyed by component name.
    pub(crate) trusted: HashMap<String, StrongName>,
    pub(crate) limits: ResourceLimits,
    statics: Mutex<HashMap<String, Value>>,
    workers: Mutex<HashSet<i32>>,
    disposed: AtomicBool,
    runs: AtomicU64,
}

impl Domain {
    pub(crate) fn statics(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.statics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn workers(&self) -> MutexGuard<'_, HashSet<i32>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to an isolated execution domain. Clones share the same domain.
#[derive(Clone)]
pub struct IsolationBoundary {
    inner: Arc<Domain>,
}

impl std::fmt::Debug for IsolationBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationBoundary")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl IsolationBoundary {
    /// Establishes a new worker-backed domain.
    ///
    /// `profile` defaults to [`PermissionSet::low_trust`]. Every trusted
    /// component must pass `verifier`, otherwise creation fails with
    /// `UntrustedComponent`.
    pub fn create(
        name: impl Into<String>,
        trusted: &[ComponentIdentity],
        profile: Option<PermissionSet>,
        verifier: &dyn IdentityVerifier,
    ) -> Result<Self, BoundaryError> {
        Self::establish(
            name.into(),
            DomainKind::Worker,
            trusted,
            profile,
            verifier,
            ResourceLimits::default(),
        )
    }

    /// Worker-backed domain with the profile, signer allowlist and resource
    /// limits of `policy`.
    pub fn from_policy(
        name: impl Into<String>,
        trusted: &[ComponentIdentity],
        policy: &SandboxPolicy,
    ) -> Result<Self, BoundaryError> {
        Self::establish(
            name.into(),
            DomainKind::Worker,
            trusted,
            Some(policy.profile()),
            &policy.verifier(),
            policy.limits,
        )
    }

    /// Domain that runs entry points on the caller's thread.
    pub fn in_process(
        name: impl Into<String>,
        trusted: &[ComponentIdentity],
        profile: Option<PermissionSet>,
        verifier: &dyn IdentityVerifier,
    ) -> Result<Self, BoundaryError> {
        Self::establish(
            name.into(),
            DomainKind::InProcess,
            trusted,
            profile,
            verifier,
            ResourceLimits::default(),
        )
    }

    fn establish(
        name: String,
        kind: DomainKind,
        trusted: &[ComponentIdentity],
        profile: Option<PermissionSet>,
        verifier: &dyn IdentityVerifier,
        limits: ResourceLimits,
    ) -> Result<Self, BoundaryError> {
        let mut trusted_names = HashMap::with_capacity(trusted.len());
        for component in trusted {
            let strong = verifier.verify(component)?;
            debug!(boundary = %name, component = %strong, "Full trust granted");
            trusted_names.insert(strong.name.clone(), strong);
        }

        let inner = Domain {
            id: Uuid::new_v4(),
            name,
            kind,
            profile: profile.unwrap_or_else(PermissionSet::low_trust),
            trusted: trusted_names,
            limits,
            statics: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashSet::new()),
            disposed: AtomicBool::new(false),
            runs: AtomicU64::new(0),
        };
        info!(
            boundary = %inner.name,
            id = %inner.id,
            kind = ?inner.kind,
            trusted = inner.trusted.len(),
            permissions = inner.profile.granted_permissions().len(),
            "Isolation boundary created"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Runs `entry` inside the domain on behalf of `caller`, with no host
    /// services behind [`DomainScope::call_host`].
    pub fn run<A, R, F>(&self, caller: &str, args: &A, entry: F) -> Result<R, BoundaryError>
    where
        A: Serialize + DeserializeOwned,
        R: Serialize + DeserializeOwned,
        F: FnOnce(&DomainScope<'_>, A) -> anyhow::Result<R>,
    {
        let boundary = self.inner.name.clone();
        self.run_with_host(caller, args, entry, move |_| {
            Err(anyhow!("boundary '{boundary}' offers no host services"))
        })
    }

    /// Runs `entry` inside the domain on behalf of `caller`.
    ///
    /// `args` are serialized on the way in and the result on the way out.
    /// Requests the entry point makes through [`DomainScope::call_host`] are
    /// answered by `host`, on the caller's side of the boundary. An error
    /// returned by `entry` comes back as `BoundaryError::Handler`; an error
    /// `host` produced keeps its original type even across a worker.
    pub fn run_with_host<A, R, F, H>(
        &self,
        caller: &str,
        args: &A,
        entry: F,
        host: H,
    ) -> Result<R, BoundaryError>
    where
        A: Serialize + DeserializeOwned,
        R: Serialize + DeserializeOwned,
        F: FnOnce(&DomainScope<'_>, A) -> anyhow::Result<R>,
        H: FnMut(Value) -> anyhow::Result<Value>,
    {
        if self.is_disposed() {
            return Err(BoundaryError::Disposed(self.inner.name.clone()));
        }

        let full_trust = self.inner.trusted.contains_key(caller);
        if !full_trust && !self.inner.profile.is_granted(Permission::Execution) {
            return Err(BoundaryError::PermissionDenied {
                component: caller.to_string(),
                permission: Permission::Execution.name().to_string(),
            });
        }

        let inbound = serde_json::to_value(args)?;
        self.inner.runs.fetch_add(1, Ordering::Relaxed);

        match self.inner.kind {
            DomainKind::InProcess => self.run_in_process(caller, full_trust, inbound, entry, host),
            DomainKind::Worker => worker::invoke(&self.inner, caller, full_trust, inbound, entry, host),
        }
    }

    fn run_in_process<A, R, F, H>(
        &self,
        caller: &str,
        full_trust: bool,
        inbound: Value,
        entry: F,
        host: H,
    ) -> Result<R, BoundaryError>
    where
        A: DeserializeOwned,
        R: Serialize + DeserializeOwned,
        F: FnOnce(&DomainScope<'_>, A) -> anyhow::Result<R>,
        H: FnMut(Value) -> anyhow::Result<Value>,
    {
        let link = DirectHost(RefCell::new(host));
        let scope = DomainScope {
            domain: &self.inner,
            caller,
            full_trust,
            statics: Statics::Shared(&self.inner.statics),
            host: &link,
        };
        let args: A = serde_json::from_value(inbound)?;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry(&scope, args)));
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return Err(BoundaryError::Handler(e)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(boundary = %self.inner.name, caller = %caller, "Handler panicked: {}", message);
                return Err(BoundaryError::Handler(anyhow::Error::new(HandlerPanic {
                    component: caller.to_string(),
                    message,
                })));
            }
        };

        Ok(serde_json::from_value(serde_json::to_value(&result)?)?)
    }

    /// Unloads the domain and every piece of state inside it, terminating
    /// any worker still running. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = {
            let mut statics = self.inner.statics();
            let n = statics.len();
            statics.clear();
            n
        };
        let terminated = worker::terminate_all(&self.inner);
        info!(
            boundary = %self.inner.name,
            id = %self.inner.id,
            runs = self.inner.runs.load(Ordering::Relaxed),
            statics_dropped = dropped,
            workers_terminated = terminated,
            "Isolation boundary disposed"
        );
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> DomainKind {
        self.inner.kind
    }

    pub fn profile(&self) -> &PermissionSet {
        &self.inner.profile
    }

    pub fn limits(&self) -> ResourceLimits {
        self.inner.limits
    }

    pub fn is_trusted(&self, component: &str) -> bool {
        self.inner.trusted.contains_key(component)
    }

    /// Number of completed or attempted entry point invocations.
    pub fn run_count(&self) -> u64 {
        self.inner.runs.load(Ordering::Relaxed)
    }

    /// Number of domain-scoped statics currently held.
    pub fn static_count(&self) -> usize {
        self.inner.statics().len()
    }
}

/// Requests from inside the domain to the code that started the run.
pub(crate) trait HostLink {
    fn call(&self, request: Value) -> anyhow::Result<Value>;
}

struct DirectHost<H>(RefCell<H>);

impl<H> HostLink for DirectHost<H>
where
    H: FnMut(Value) -> anyhow::Result<Value>,
{
    fn call(&self, request: Value) -> anyhow::Result<Value> {
        let mut host = self
            .0
            .try_borrow_mut()
            .map_err(|_| anyhow!("host call made while another is in progress"))?;
        (*host)(request)
    }
}

pub(crate) enum Statics<'a> {
    /// The domain's own table.
    Shared(&'a Mutex<HashMap<String, Value>>),
    /// A worker's copy; writes are replayed onto the domain when it reports back.
    Copied {
        view: RefCell<HashMap<String, Value>>,
        written: RefCell<HashMap<String, Value>>,
    },
}

impl Statics<'_> {
    pub(crate) fn copied(view: HashMap<String, Value>) -> Self {
        Statics::Copied {
            view: RefCell::new(view),
            written: RefCell::new(HashMap::new()),
        }
    }
}

/// What an entry point sees of the domain it runs in.
pub struct DomainScope<'a> {
    domain: &'a Domain,
    caller: &'a str,
    full_trust: bool,
    statics: Statics<'a>,
    host: &'a dyn HostLink,
}

impl<'a> DomainScope<'a> {
    pub(crate) fn new(
        domain: &'a Domain,
        caller: &'a str,
        full_trust: bool,
        statics: Statics<'a>,
        host: &'a dyn HostLink,
    ) -> Self {
        Self {
            domain,
            caller,
            full_trust,
            statics,
            host,
        }
    }

    pub fn caller(&self) -> &str {
        self.caller
    }

    pub fn is_full_trust(&self) -> bool {
        self.full_trust
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.full_trust || self.domain.profile.is_granted(permission)
    }

    /// Fails unless the caller holds `permission`.
    pub fn demand(&self, permission: Permission) -> Result<(), BoundaryError> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(BoundaryError::PermissionDenied {
                component: self.caller.to_string(),
                permission: permission.name().to_string(),
            })
        }
    }

    pub fn static_get(&self, key: &str) -> Option<Value> {
        match &self.statics {
            Statics::Shared(table) => table
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned(),
            Statics::Copied { view, .. } => view.borrow().get(key).cloned(),
        }
    }

    pub fn static_set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        match &self.statics {
            Statics::Shared(table) => table
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key, value),
            Statics::Copied { view, written } => {
                written.borrow_mut().insert(key.clone(), value.clone());
                view.borrow_mut().insert(key, value)
            }
        }
    }

    /// Sends `request` to the host side of the boundary and waits for its answer.
    pub fn call_host(&self, request: Value) -> anyhow::Result<Value> {
        self.host.call(request)
    }

    /// Statics written during this run, for a worker to report back.
    pub(crate) fn take_written(&self) -> HashMap<String, Value> {
        match &self.statics {
            Statics::Shared(_) => HashMap::new(),
            Statics::Copied { written, .. } => std::mem::take(&mut *written.borrow_mut()),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
