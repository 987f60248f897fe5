//! # Layers
//!
//! A [`Layer`] describes how to construct a service. A [`LayerGraph`]
//! builds each layer at most once and shares the value with every fiber
//! that asks for it.
//!
//! ## Construction
//!
//! The first request for a layer claims a slot in the graph and constructs
//! the service inside a fresh inner scope. Concurrent requests for the same
//! layer wait on the slot instead of building again. Once construction
//! succeeds, the inner scope's close is registered with the scope of the
//! request that triggered it. Dependencies finish first, so their close is
//! registered first and runs last:
//!
//! ```text
//!   build(repo) ─┬─ build(db) ── register close(db)
//!                └─ register close(repo)
//!
//!   close(outer) ── close(repo) ── close(db)
//! ```
//!
//! A failed construction closes its inner scope immediately. The failure is
//! kept in the graph, so later requests see the same cause. A construction
//! cut short by interrupting its requester is not kept: the slot is removed
//! and requests still waiting on it start over.
//!
//! Claiming a slot and deciding to build happen inside one uninterruptible
//! region, so a slot is never claimed without being completed.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cause::{AnyError, Failure};
use crate::deferred::Deferred;
use crate::effect::{guarded, Effect, Op, Restore};
use crate::exit::Exit;
use crate::scope::{scoped, Scope};

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

type SharedService = Arc<dyn Any + Send + Sync>;
type Slot = Deferred<SharedService, AnyError>;

/// Identity of a layer. Clones of a layer share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u64);

impl LayerId {
    /// Numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Layer({})", self.0)
    }
}

struct Node<S, E> {
    id: LayerId,
    name: String,
    build: Box<dyn Fn() -> Effect<S, E> + Send + Sync>,
}

/// A recipe for a service of type `S`.
pub struct Layer<S, E = Infallible> {
    node: Arc<Node<S, E>>,
}

impl<S, E> Clone for Layer<S, E> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<S, E> fmt::Debug for Layer<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.node.id)
            .field("name", &self.node.name)
            .finish()
    }
}

/// Graph and scope visible to a construction effect.
#[derive(Clone)]
struct BuildContext {
    graph: LayerGraph,
    scope: Scope,
}

impl<S, E> Layer<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Failure,
{
    /// A layer constructed by `build`.
    ///
    /// The construction effect runs with a scope of its own in context, so
    /// resources it acquires live as long as the service.
    pub fn scoped<F>(name: impl Into<String>, build: F) -> Self
    where
        F: Fn() -> Effect<S, E> + Send + Sync + 'static,
    {
        Self {
            node: Arc::new(Node {
                id: LayerId(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed)),
                name: name.into(),
                build: Box::new(build),
            }),
        }
    }

    /// A layer holding a ready value.
    pub fn succeed(name: impl Into<String>, value: S) -> Self {
        Self::scoped(name, move || Effect::succeed(value.clone()))
    }

    /// Identity of this layer.
    pub fn id(&self) -> LayerId {
        self.node.id
    }

    /// Name given at creation.
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Request this layer as a dependency from inside another layer's
    /// construction. Dies anywhere else.
    pub fn get(&self) -> Effect<S, E> {
        let layer = self.clone();
        Effect::from_op(Op::WithFiber(Box::new(move |ctx| {
            match ctx.env().get::<BuildContext>() {
                Some(build) => build.graph.build(&layer, &build.scope).into_op(),
                None => Op::die(format!(
                    "layer {} requested outside a layer construction",
                    layer.name()
                )),
            }
        })))
    }
}

#[derive(Default)]
struct GraphInner {
    slots: Mutex<HashMap<LayerId, Slot>>,
    constructions: AtomicUsize,
}

/// Memo table of built layers.
#[derive(Clone, Default)]
pub struct LayerGraph {
    inner: Arc<GraphInner>,
}

impl fmt::Debug for LayerGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerGraph")
            .field("layers", &self.len())
            .field("constructions", &self.construction_count())
            .finish()
    }
}

impl LayerGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// The service of `layer`, constructing it on first request.
    ///
    /// `scope` is the scope that releases the service if this request is
    /// the one that builds it.
    pub fn build<S, E>(&self, layer: &Layer<S, E>, scope: &Scope) -> Effect<S, E>
    where
        S: Clone + Send + Sync + 'static,
        E: Failure,
    {
        let graph = self.clone();
        let layer = layer.clone();
        let scope = scope.clone();
        Effect::uninterruptible_mask(move |restore| {
            Effect::suspend(move || {
                let (slot, first) = graph.claim(layer.id());
                let construct = if first {
                    graph.construct(&layer, &scope, slot.clone(), restore)
                } else {
                    Effect::unit()
                };
                let wait = restore.apply(slot.wait_exit::<E>());
                construct.widen::<E>().zip_right(wait).flat_map(move |exit| {
                    if graph.abandoned(layer.id(), &slot) {
                        restore.apply(graph.build(&layer, &scope))
                    } else {
                        Effect::from_exit(typed(exit))
                    }
                })
            })
        })
    }

    /// True once `layer` has been built successfully.
    pub fn is_built<S, E>(&self, layer: &Layer<S, E>) -> bool {
        self.inner
            .slots
            .lock()
            .get(&layer.node.id)
            .and_then(|slot| slot.poll())
            .map(|exit| exit.is_success())
            .unwrap_or(false)
    }

    /// Number of layers requested so far.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// True if no layer has been requested.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of constructions started.
    pub fn construction_count(&self) -> usize {
        self.inner.constructions.load(Ordering::Acquire)
    }

    /// True if `slot` was given up by an interrupted construction and
    /// removed from the graph.
    fn abandoned(&self, id: LayerId, slot: &Slot) -> bool {
        match self.inner.slots.lock().get(&id) {
            Some(current) => !current.same_cell(slot),
            None => true,
        }
    }

    fn release(&self, id: LayerId, slot: &Slot) {
        let mut slots = self.inner.slots.lock();
        if slots.get(&id).is_some_and(|current| current.same_cell(slot)) {
            slots.remove(&id);
        }
    }

    fn claim(&self, id: LayerId) -> (Slot, bool) {
        let mut slots = self.inner.slots.lock();
        match slots.get(&id) {
            Some(slot) => (slot.clone(), false),
            None => {
                let slot = Slot::new();
                slots.insert(id, slot.clone());
                (slot, true)
            }
        }
    }

    /// Construct `layer` into `slot`. Runs inside the mask of the request
    /// that claimed the slot; only the layer's own build is restored.
    fn construct<S, E>(
        &self,
        layer: &Layer<S, E>,
        outer: &Scope,
        slot: Slot,
        restore: Restore,
    ) -> Effect<(), Infallible>
    where
        S: Clone + Send + Sync + 'static,
        E: Failure,
    {
        let graph = self.clone();
        let layer = layer.clone();
        let outer = outer.clone();
        Effect::suspend(move || {
            graph.inner.constructions.fetch_add(1, Ordering::AcqRel);
            debug!(layer = layer.name(), id = layer.id().as_u64(), "building layer");

            let inner = Scope::new();
            let context = BuildContext {
                graph: graph.clone(),
                scope: outer.clone(),
            };
            let node = Arc::clone(&layer.node);
            let build = Effect::suspend(move || guarded(|| (node.build)())).provide_service(context);

            restore
                .apply(inner.extend(build))
                .exit()
                .flat_map(move |exit: Exit<E, S>| {
                    let any = exit.to_any_exit();
                    match exit {
                        Exit::Success(service) => {
                            let owned = inner.clone();
                            outer
                                .add_finalizer::<Infallible>(Box::new(move |exit| owned.close(exit)))
                                .zip_right(slot.succeed(Arc::new(service) as SharedService))
                                .as_unit()
                        }
                        Exit::Failure(cause) => {
                            if cause.is_interrupted_only() {
                                debug!(layer = layer.name(), "layer construction interrupted");
                                graph.release(layer.id(), &slot);
                            } else {
                                debug!(layer = layer.name(), "layer construction failed");
                            }
                            inner
                                .close::<Infallible>(&any)
                                .exit()
                                .flat_map(move |closed| {
                                    slot.fail_cause(cause.erase().then(closed.into_cause().widen()))
                                })
                                .as_unit()
                        }
                    }
                })
        })
    }
}

fn typed<S, E>(exit: Exit<AnyError, SharedService>) -> Exit<E, S>
where
    S: Clone + 'static,
    E: Failure,
{
    match exit {
        Exit::Success(service) => match service.downcast_ref::<S>() {
            Some(service) => Exit::Success(service.clone()),
            None => Exit::die(format!("layer service is not a {}", type_name::<S>())),
        },
        Exit::Failure(cause) => Exit::Failure(cause.unerase()),
    }
}

impl<A: Send + 'static, E: Failure> Effect<A, E> {
    /// Build `layer` in a fresh scope and graph, run with its service in
    /// context, then release it.
    pub fn provide_layer<S>(self, layer: &Layer<S, E>) -> Effect<A, E>
    where
        S: Clone + Send + Sync + 'static,
    {
        let layer = layer.clone();
        scoped(Effect::<Scope, E>::scope().flat_map(move |scope| {
            LayerGraph::new()
                .build(&layer, &scope)
                .flat_map(move |service| self.provide_service(service))
        }))
    }
}
