//! Name-based request routing to dynamically registered handler objects,
//! argument coercion, promise chaining, and signal-to-event broadcast fan
//! out across every connected peer.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::config::ServiceConfig;
use crate::peer::{IncomingRequest, Inbound, Peer};
use crate::promise::Promise;
use crate::value::{FromValue, Value};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("object name {0:?} must not contain '.'")]
    InvalidObjectName(String),
}

/// What a handler returns: either an immediate result, or a promise the
/// dispatcher chains a reply onto once it settles.
pub enum HandlerOutcome {
    Ready(Result<Value, String>),
    Pending(Promise<Value>),
}

pub type HandlerFn = Arc<dyn Fn(Vec<Value>) -> HandlerOutcome + Send + Sync>;

/// Collects named handlers for one registered object.
#[derive(Default)]
pub struct ObjectBuilder {
    handlers: HashMap<String, HandlerFn>,
}

impl ObjectBuilder {
    pub fn new() -> Self {
        ObjectBuilder::default()
    }

    /// Registers a raw handler that receives the full positional argument
    /// list and returns a [`HandlerOutcome`] directly -- the escape hatch
    /// for handlers that need `Pending` (an async method) or custom
    /// argument-count handling.
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> HandlerOutcome + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(f));
        self
    }

    pub fn method0<R, F>(self, name: impl Into<String>, f: F) -> Self
    where
        R: Into<Value>,
        F: Fn() -> Result<R, String> + Send + Sync + 'static,
    {
        self.method(name, move |_args: Vec<Value>| HandlerOutcome::Ready(f().map(Into::into)))
    }

    pub fn method1<A, R, F>(self, name: impl Into<String>, f: F) -> Self
    where
        A: FromValue,
        R: Into<Value>,
        F: Fn(A) -> Result<R, String> + Send + Sync + 'static,
    {
        self.method(name, move |args: Vec<Value>| {
            if args.is_empty() {
                return HandlerOutcome::Ready(Err("insufficient arguments".to_string()));
            }
            let a = match A::from_value(&args[0]) {
                Ok(v) => v,
                Err(e) => return HandlerOutcome::Ready(Err(e)),
            };
            HandlerOutcome::Ready(f(a).map(Into::into))
        })
    }

    pub fn method2<A, B, R, F>(self, name: impl Into<String>, f: F) -> Self
    where
        A: FromValue,
        B: FromValue,
        R: Into<Value>,
        F: Fn(A, B) -> Result<R, String> + Send + Sync + 'static,
    {
        self.method(name, move |args: Vec<Value>| {
            if args.len() < 2 {
                return HandlerOutcome::Ready(Err("insufficient arguments".to_string()));
            }
            let a = match A::from_value(&args[0]) {
                Ok(v) => v,
                Err(e) => return HandlerOutcome::Ready(Err(e)),
            };
            let b = match B::from_value(&args[1]) {
                Ok(v) => v,
                Err(e) => return HandlerOutcome::Ready(Err(e)),
            };
            HandlerOutcome::Ready(f(a, b).map(Into::into))
        })
    }

    pub fn method3<A, B, C, R, F>(self, name: impl Into<String>, f: F) -> Self
    where
        A: FromValue,
        B: FromValue,
        C: FromValue,
        R: Into<Value>,
        F: Fn(A, B, C) -> Result<R, String> + Send + Sync + 'static,
    {
        self.method(name, move |args: Vec<Value>| {
            if args.len() < 3 {
                return HandlerOutcome::Ready(Err("insufficient arguments".to_string()));
            }
            let a = match A::from_value(&args[0]) {
                Ok(v) => v,
                Err(e) => return HandlerOutcome::Ready(Err(e)),
            };
            let b = match B::from_value(&args[1]) {
                Ok(v) => v,
                Err(e) => return HandlerOutcome::Ready(Err(e)),
            };
            let c = match C::from_value(&args[2]) {
                Ok(v) => v,
                Err(e) => return HandlerOutcome::Ready(Err(e)),
            };
            HandlerOutcome::Ready(f(a, b, c).map(Into::into))
        })
    }

    pub fn method4<A, B, C, D, R, F>(self, name: impl Into<String>, f: F) -> Self
    where
        A: FromValue,
        B: FromValue,
        C: FromValue,
        D: FromValue,
        R: Into<Value>,
        F: Fn(A, B, C, D) -> Result<R, String> + Send + Sync + 'static,
    {
        self.method(name, move |args: Vec<Value>| {
            if args.len() < 4 {
                return HandlerOutcome::Ready(Err("insufficient arguments".to_string()));
            }
            let a = match A::from_value(&args[0]) {
                Ok(v) => v,
                Err(e) => return HandlerOutcome::Ready(Err(e)),
            };
            let b = match B::from_value(&args[1]) {
                Ok(v) => v,
                Err(e) => return HandlerOutcome::Ready(Err(e)),
            };
            let c = match C::from_value(&args[2]) {
                Ok(v) => v,
                Err(e) => return HandlerOutcome::Ready(Err(e)),
            };
            let d = match D::from_value(&args[3]) {
                Ok(v) => v,
                Err(e) => return HandlerOutcome::Ready(Err(e)),
            };
            HandlerOutcome::Ready(f(a, b, c, d).map(Into::into))
        })
    }
}

struct ServiceShared {
    objects: Mutex<HashMap<String, HashMap<String, HandlerFn>>>,
    peers: Mutex<Vec<Arc<Peer>>>,
    peer_config: crate::config::PeerConfig,
    shut_down: AtomicBool,
}

/// A dispatcher bound to a registry of handler objects. Wraps accepted
/// streams into peers and routes their inbound requests.
pub struct Service {
    shared: Arc<ServiceShared>,
}

impl Service {
    pub fn new(config: ServiceConfig) -> Service {
        Service {
            shared: Arc::new(ServiceShared {
                objects: Mutex::new(HashMap::new()),
                peers: Mutex::new(Vec::new()),
                peer_config: config.peer,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Wraps an already-accepted stream into a peer, tracks it in the live
    /// set, and spawns the task that routes its inbound requests. The
    /// embedder owns the actual accept loop (e.g. a `TcpListener` loop)
    /// and calls this once per connection.
    pub async fn accept<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            debug!("service: ignoring accept() after shutdown");
            return;
        }
        let (peer, mut events) = Peer::new(stream, self.shared.peer_config.clone());
        let peer = Arc::new(peer);
        self.shared.peers.lock().unwrap().push(peer.clone());

        let shared = self.shared.clone();
        let peer_for_cleanup = peer.clone();
        tokio::spawn(async move {
            while let Some(inbound) = events.recv().await {
                match inbound {
                    Inbound::Request(request) => handle_request(&shared, request).await,
                    Inbound::Event { name, .. } => {
                        debug!(event = %name, "service: ignoring inbound event from peer");
                    }
                }
            }
            shared
                .peers
                .lock()
                .unwrap()
                .retain(|p| !Arc::ptr_eq(p, &peer_for_cleanup));
        });
    }

    /// Registers `builder`'s handlers under `name`. Re-registering an
    /// already-used name replaces the prior binding; requests already
    /// dispatched against the old binding still complete against it, since
    /// dispatch captures a clone of the handler before awaiting.
    pub fn register_object(
        &self,
        name: impl Into<String>,
        builder: ObjectBuilder,
    ) -> Result<ObjectHandle, ServiceError> {
        let name = name.into();
        if name.contains('.') {
            return Err(ServiceError::InvalidObjectName(name));
        }
        self.shared.objects.lock().unwrap().insert(name.clone(), builder.handlers);
        Ok(ObjectHandle {
            name,
            shared: self.shared.clone(),
        })
    }

    /// Removes a registered object. A no-op if `name` isn't registered.
    pub fn unregister_object(&self, name: &str) {
        self.shared.objects.lock().unwrap().remove(name);
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.lock().unwrap().len()
    }

    /// Marks the service shut down (no further `accept()` calls are
    /// honored), then closes every live peer, rejecting their outstanding
    /// pending requests, and finally clears the registry.
    pub async fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);
        let peers: Vec<Arc<Peer>> = std::mem::take(&mut *self.shared.peers.lock().unwrap());
        for peer in peers {
            peer.close();
        }
        self.shared.objects.lock().unwrap().clear();
    }
}

/// Capability returned from [`Service::register_object`] that lets the
/// owner broadcast a named signal as an event to every connected peer.
/// There is no reflective "every signal of this object" in Rust, so
/// emission is this explicit call rather than an implicit wiring done at
/// registration time.
pub struct ObjectHandle {
    name: String,
    shared: Arc<ServiceShared>,
}

impl ObjectHandle {
    /// Broadcasts `"{object}.{signal}"` with `args` as an event to every
    /// peer currently connected. Best-effort: a peer that has already
    /// closed simply drops the event rather than aborting the broadcast.
    /// A no-op once `self.name` has been unregistered, since the handle
    /// then no longer names a live object.
    pub async fn emit_signal(&self, signal: impl AsRef<str>, args: Vec<Value>) {
        if !self.shared.objects.lock().unwrap().contains_key(&self.name) {
            return;
        }
        let event_name = format!("{}.{}", self.name, signal.as_ref());
        let peers: Vec<Arc<Peer>> = self.shared.peers.lock().unwrap().clone();
        for peer in peers {
            peer.send_event(event_name.clone(), Value::List(args.clone())).await;
        }
    }
}

async fn handle_request(shared: &Arc<ServiceShared>, request: IncomingRequest) {
    let (obj_name, method_name) = split_method(request.method());

    let (handler, object_missing) = {
        let objects = shared.objects.lock().unwrap();
        match objects.get(&obj_name) {
            Some(handlers) => (handlers.get(&method_name).cloned(), false),
            None => (None, true),
        }
    };
    let handler = match handler {
        Some(h) => h,
        None => {
            let message = if object_missing {
                "RPC object not found"
            } else {
                "RPC method not found"
            };
            request.reject(message).await;
            return;
        }
    };

    let args = request.args().clone().into_positional();

    let outcome = match catch_unwind(AssertUnwindSafe(|| handler(args))) {
        Ok(outcome) => outcome,
        Err(panic) => {
            request.reject(format!("handler panicked: {}", panic_message(panic))).await;
            return;
        }
    };

    match outcome {
        HandlerOutcome::Ready(Ok(value)) => request.resolve(value).await,
        HandlerOutcome::Ready(Err(message)) => request.reject(message).await,
        HandlerOutcome::Pending(promise) => match promise.await {
            Ok(value) => request.resolve(value).await,
            Err(message) => request.reject(message).await,
        },
    }
}

fn split_method(method: &str) -> (String, String) {
    match method.split_once('.') {
        Some((obj, rest)) => (obj.to_string(), rest.to_string()),
        None => (String::new(), method.to_string()),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
