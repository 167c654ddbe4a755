/*
 * Copyright 2025 Carver Automation Corporation.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Typed publish/subscribe registry.
//!
//! Emission is a synchronous fan-out in registration order over a snapshot of
//! the handler list taken when `emit` starts, so handlers registered or removed
//! mid-emission only affect later emissions. Each handler call is isolated: a
//! panicking handler is logged and the remaining handlers still run.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{trace, warn};

use crate::events::{EventKind, SyncEvent};

/// Callback registered for one event kind.
pub type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Token returned by [`EventBus::on`]; pass it to [`EventBus::off`] to
/// unregister. Handlers stay registered until explicitly removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: BTreeMap<EventKind, Vec<(u64, Handler)>>,
    sealed: bool,
}

#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `handler` for `kind`. Multiple handlers per kind are allowed
    /// and are invoked in registration order.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription { kind, id }
    }

    /// Register one handler for every event kind.
    pub fn on_any<F>(&self, handler: F) -> Vec<Subscription>
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        EventKind::ALL
            .iter()
            .map(|kind| {
                let handler = Arc::clone(&handler);
                self.on(*kind, move |event| handler(event))
            })
            .collect()
    }

    /// Unregister a handler. Unknown or already removed subscriptions are a no-op.
    pub fn off(&self, subscription: &Subscription) {
        let mut registry = self.registry();
        if let Some(handlers) = registry.handlers.get_mut(&subscription.kind) {
            handlers.retain(|(id, _)| *id != subscription.id);
            if handlers.is_empty() {
                registry.handlers.remove(&subscription.kind);
            }
        }
    }

    /// Deliver `event` to every handler currently registered for its kind.
    pub fn emit(&self, event: SyncEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let registry = self.registry();
            if registry.sealed {
                trace!(%kind, "event bus closed; dropping emission");
                return;
            }
            match registry.handlers.get(&kind) {
                Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };

        for (index, handler) in handlers.iter().enumerate() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                warn!(
                    %kind,
                    handler = index,
                    error = %panic_message(panic.as_ref()),
                    "event handler panicked"
                );
            }
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.registry().handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Drop every handler and stop delivering emissions until [`reopen`].
    ///
    /// [`reopen`]: EventBus::reopen
    pub fn close(&self) {
        let mut registry = self.registry();
        registry.handlers.clear();
        registry.sealed = true;
    }

    /// Re-open a closed bus so a re-initialised layer can publish again.
    pub fn reopen(&self) {
        self.registry().sealed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.registry().sealed
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
