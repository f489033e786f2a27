//! Name → handler table for notifications pushed by Klippy.
//!
//! Klippy only pushes what a client asked for through a `response_template`,
//! so every method name that can arrive is known up front. Two names are
//! built in (status updates and gcode output) and handled by the bridge
//! itself; everything else is a [`RemoteMethodHandler`] registered before the
//! bridge starts. Handlers flagged for upstream registration are announced to
//! Klippy with `register_remote_method` after every successful handshake.

use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use klippy_protocol::KlippyNotification;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Callback invoked when Klippy calls a registered remote method.
#[async_trait]
pub trait RemoteMethodHandler: Send + Sync + 'static {
    /// Handle one invocation. Errors are logged by the bridge.
    async fn call(&self, params: Map<String, Value>) -> Result<()>;
}

/// Adapter turning an async closure into a [`RemoteMethodHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RemoteMethodHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self, params: Map<String, Value>) -> Result<()> {
        (self.0)(params).await
    }
}

/// Wrap an async closure as a shareable remote method handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RemoteMethodHandler>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Where a notification is routed.
#[derive(Clone)]
pub(crate) enum Target {
    /// Built-in: feed the subscription aggregator.
    StatusUpdate,
    /// Built-in: publish gcode terminal output.
    GcodeResponse,
    /// User registered callback.
    Remote(Arc<dyn RemoteMethodHandler>),
}

/// One registered name.
struct Registration {
    /// Routing target.
    target: Target,
    /// Announce to Klippy after each handshake.
    upstream: bool,
}

/// Registered names and whether more may be added.
struct Table {
    /// Registered names.
    methods: HashMap<String, Registration>,
    /// Set once the bridge starts; registration is closed afterwards.
    sealed: bool,
}

/// Process-lifetime notification routing table.
pub(crate) struct Dispatcher {
    /// Routing table; `sealed` is only read and written under this lock.
    table: RwLock<Table>,
}

impl Dispatcher {
    /// Table holding only the built-in targets.
    pub(crate) fn new() -> Self {
        let mut methods = HashMap::new();
        for (name, target) in [
            (KlippyNotification::StatusUpdate, Target::StatusUpdate),
            (KlippyNotification::GcodeResponse, Target::GcodeResponse),
        ] {
            methods.insert(
                name.as_str().to_string(),
                Registration {
                    target,
                    upstream: false,
                },
            );
        }
        Self {
            table: RwLock::new(Table {
                methods,
                sealed: false,
            }),
        }
    }

    /// Register `name`. Fails after [`seal`](Self::seal) or for a name that
    /// is already taken (built-ins included).
    pub(crate) fn register(
        &self,
        name: &str,
        handler: Arc<dyn RemoteMethodHandler>,
        upstream: bool,
    ) -> Result<()> {
        let mut table = self.table.write();
        if table.sealed {
            return Err(Error::AlreadyRunning(name.to_string()));
        }
        if table.methods.contains_key(name) {
            return Err(Error::DuplicateMethod(name.to_string()));
        }
        table.methods.insert(
            name.to_string(),
            Registration {
                target: Target::Remote(handler),
                upstream,
            },
        );
        Ok(())
    }

    /// Close registration.
    pub(crate) fn seal(&self) {
        self.table.write().sealed = true;
    }

    /// Look up the target for an inbound notification.
    pub(crate) fn lookup(&self, name: &str) -> Option<Target> {
        self.table
            .read()
            .methods
            .get(name)
            .map(|r| r.target.clone())
    }

    /// Names Klippy must be told about after each handshake, sorted.
    pub(crate) fn upstream_methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .table
            .read()
            .methods
            .iter()
            .filter(|(_, r)| r.upstream)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn noop() -> Arc<dyn RemoteMethodHandler> {
        handler_fn(|_params| async { Ok(()) })
    }

    #[test]
    fn builtins_are_present() {
        let d = Dispatcher::new();
        assert!(matches!(
            d.lookup("process_status_update"),
            Some(Target::StatusUpdate)
        ));
        assert!(matches!(
            d.lookup("process_gcode_response"),
            Some(Target::GcodeResponse)
        ));
        assert!(d.lookup("nope").is_none());
        assert!(d.upstream_methods().is_empty());
    }

    #[test]
    fn duplicates_and_late_registration_are_rejected() {
        let d = Dispatcher::new();
        d.register("timelapse_newframe", noop(), true).unwrap();
        d.register("local_only", noop(), false).unwrap();
        assert!(matches!(
            d.register("timelapse_newframe", noop(), false),
            Err(Error::DuplicateMethod(_))
        ));
        assert!(matches!(
            d.register("process_status_update", noop(), false),
            Err(Error::DuplicateMethod(_))
        ));
        assert_eq!(d.upstream_methods(), vec!["timelapse_newframe".to_string()]);

        d.seal();
        assert!(matches!(
            d.register("late", noop(), true),
            Err(Error::AlreadyRunning(_))
        ));
    }

    #[test]
    fn nothing_lands_after_seal() {
        let d = Dispatcher::new();
        let accepted = thread::scope(|s| {
            let worker = s.spawn(|| {
                let mut accepted = 0;
                for n in 0.. {
                    match d.register(&format!("m{n}"), noop(), true) {
                        Ok(()) => accepted += 1,
                        Err(_) => break,
                    }
                }
                accepted
            });
            while d.upstream_methods().len() < 10 {
                thread::yield_now();
            }
            d.seal();
            let at_seal = d.upstream_methods().len();
            let accepted = worker.join().unwrap();
            assert_eq!(d.upstream_methods().len(), at_seal);
            accepted
        });
        assert_eq!(accepted, d.upstream_methods().len());
    }

    #[tokio::test]
    async fn closures_become_handlers() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler = handler_fn(move |params| {
            let tx = tx.clone();
            async move {
                tx.send(params).ok();
                Ok(())
            }
        });
        let mut params = Map::new();
        params.insert("frame".into(), Value::from(3));
        handler.call(params.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(params));
    }
}
