#![allow(dead_code)]

use dbtenant::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared record of unit steps, e.g. `["up:001", "down:001"]`.
#[derive(Clone, Default)]
pub struct StepLog(Arc<Mutex<Vec<String>>>);

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

/// Unit with an `up` and a `down` that only log.
pub fn logged_unit(name: &str, log: &StepLog) -> FnUnit {
    let up_log = log.clone();
    let down_log = log.clone();
    let up_name = name.to_string();
    let down_name = name.to_string();
    FnUnit::new(name, move |_| {
        let log = up_log.clone();
        let name = up_name.clone();
        async move {
            log.push(format!("up:{}", name));
            Ok(())
        }
    })
    .with_down(move |_| {
        let log = down_log.clone();
        let name = down_name.clone();
        async move {
            log.push(format!("down:{}", name));
            Ok(())
        }
    })
}

/// Unit whose `up` always fails.
pub fn failing_unit(name: &str) -> FnUnit {
    let message = format!("{} exploded", name);
    FnUnit::new(name, move |_| {
        let message = message.clone();
        async move { Err::<(), _>(AppError::Adapter(message)) }
    })
}

/// Unit whose `up` takes `delay`.
pub fn slow_unit(name: &str, delay: Duration) -> FnUnit {
    FnUnit::new(name, move |_| async move {
        tokio::time::sleep(delay).await;
        Ok(())
    })
}

pub fn unit_set(label: &str, units: Vec<FnUnit>) -> Arc<UnitSet> {
    let set = UnitSet::new(label);
    for unit in units {
        set.push(Arc::new(unit));
    }
    Arc::new(set)
}

pub fn memory_adapter(name: &str) -> (Arc<MemoryAdapter>, AdapterHandle) {
    let memory = Arc::new(MemoryAdapter::new(name));
    let handle: AdapterHandle = memory.clone();
    (memory, handle)
}

/// Collects the names of every event emitted on `bus`.
pub fn record_events(bus: &EventBus) -> Arc<Mutex<Vec<LifecycleEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe_all(move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    })
    .unwrap();
    seen
}

pub fn event_names(events: &Arc<Mutex<Vec<LifecycleEvent>>>) -> Vec<&'static str> {
    events.lock().unwrap().iter().map(|e| e.name()).collect()
}
