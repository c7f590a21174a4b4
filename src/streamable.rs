//! Batched resolution of asset references into loaded objects.
//!
//! Synchronous and asynchronous loads share one pipeline: every load is a
//! queued request, and a synchronous load is a request flushed before the
//! caller returns.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};
use tracing::{debug, info, warn};

use crate::AssetReference;
use crate::objects::{ObjectHandle, ObjectRegistry};
use crate::platform_file::PlatformFileChain;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoadMode {
    #[default]
    Sync,
    Async,
}

/// Final classification of a load request.
#[derive(Debug, Default, Clone)]
pub struct LoadedAssets {
    pub classes: Vec<ObjectHandle>,
    pub objects: Vec<ObjectHandle>,
    /// References that couldn't be resolved, with or without the class suffix.
    pub skipped: Vec<AssetReference>,
}

pub type LoadCallback = Box<dyn FnOnce(LoadedAssets) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

struct LoadRequest {
    id: RequestId,
    pending: VecDeque<AssetReference>,
    result: LoadedAssets,
    callback: LoadCallback,
}
impl LoadRequest {
    fn complete(self) {
        info!(
            target: "pakloader",
            "Load request {} done: {} classes, {} objects, {} skipped",
            self.id.0,
            self.result.classes.len(),
            self.result.objects.len(),
            self.result.skipped.len()
        );
        (self.callback)(self.result);
    }
}

pub struct StreamableManager {
    requests: VecDeque<LoadRequest>,
    batch_size: usize,
    next_id: u64,
}
impl StreamableManager {
    pub fn new(batch_size: usize) -> Self {
        Self {
            requests: VecDeque::new(),
            batch_size: batch_size.max(1),
            next_id: 0,
        }
    }

    /// Queues `references`; `callback` runs exactly once, from `tick` or
    /// `flush`, with the final classification.
    pub fn request(&mut self, references: Vec<AssetReference>, callback: LoadCallback) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        debug!(target: "pakloader", "Queued load request {} for {} references", id.0, references.len());
        self.requests.push_back(LoadRequest {
            id,
            pending: references.into(),
            result: LoadedAssets::default(),
            callback,
        });
        id
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.requests.iter().any(|request| request.id == id)
    }
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Resolves up to the batch size worth of references, oldest request
    /// first. Returns the number of requests completed.
    pub fn tick(&mut self, objects: &mut ObjectRegistry, files: &PlatformFileChain) -> usize {
        let mut budget = self.batch_size;
        let mut completed = 0;
        while let Some(request) = self.requests.front_mut() {
            if let Some(reference) = request.pending.front() {
                if budget == 0 {
                    break;
                }
                resolve_one(objects, files, reference, &mut request.result);
                request.pending.pop_front();
                budget -= 1;
            }
            if request.pending.is_empty() {
                if let Some(request) = self.requests.pop_front() {
                    request.complete();
                    completed += 1;
                }
            }
        }
        completed
    }

    /// Resolves every outstanding reference of `id` now.
    pub fn flush(&mut self, id: RequestId, objects: &mut ObjectRegistry, files: &PlatformFileChain) -> bool {
        let Some(index) = self.requests.iter().position(|request| request.id == id) else {
            return false;
        };
        let Some(mut request) = self.requests.remove(index) else {
            return false;
        };
        while let Some(reference) = request.pending.pop_front() {
            resolve_one(objects, files, &reference, &mut request.result);
        }
        request.complete();
        true
    }
}

/// Loads `reference`, retrying once with the compiled class suffix, and
/// files the result as a class or a plain object.
fn resolve_one(objects: &mut ObjectRegistry, files: &PlatformFileChain, reference: &AssetReference, result: &mut LoadedAssets) {
    let found = objects.try_load(files, reference.as_str()).or_else(|| objects.try_load(files, reference.with_class_suffix().as_str()));
    let Some(object) = found else {
        warn!(target: "pakloader", "Not loaded: {reference}");
        result.skipped.push(reference.clone());
        return;
    };
    debug!(target: "pakloader", "Loaded {}", object.path());
    match objects.class_of(files, &object) {
        Some(class) => result.classes.push(class),
        None => result.objects.push(object),
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::objects::test::FakePackages;
    use pretty_assertions::assert_eq;

    fn references() -> Vec<AssetReference> {
        ["/Game/bp/Turret", "/Game/bp/Drone", "/Game/data/Table", "/Game/bp/Missing"].into_iter().map(AssetReference::new).collect()
    }

    type Calls = Arc<Mutex<Vec<LoadedAssets>>>;

    fn recorder() -> (Calls, LoadCallback) {
        let calls: Calls = Default::default();
        let sink = calls.clone();
        (calls, Box::new(move |assets| sink.lock().unwrap().push(assets)))
    }

    fn paths(objects: &[ObjectHandle]) -> Vec<String> {
        objects.iter().map(|o| o.path()).collect()
    }

    #[test]
    fn test_flush_classifies() {
        let files = PlatformFileChain::default();
        let mut registry = ObjectRegistry::new(Box::new(FakePackages));
        let mut manager = StreamableManager::new(8);
        let (calls, callback) = recorder();

        let id = manager.request(references(), callback);
        assert!(manager.flush(id, &mut registry, &files));
        assert!(!manager.flush(id, &mut registry, &files));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(paths(&calls[0].classes), vec!["/Game/bp/Turret.Turret_C", "/Game/bp/Drone.Drone_C"]);
        assert_eq!(paths(&calls[0].objects), vec!["/Game/data/Table.Table"]);
        assert_eq!(calls[0].skipped, vec![AssetReference::new("/Game/bp/Missing")]);
    }

    #[test]
    fn test_tick_in_batches() {
        let files = PlatformFileChain::default();
        let mut registry = ObjectRegistry::new(Box::new(FakePackages));
        let mut manager = StreamableManager::new(3);
        let (calls, callback) = recorder();

        let id = manager.request(references(), callback);
        assert_eq!(manager.tick(&mut registry, &files), 0);
        assert!(manager.is_pending(id));
        assert!(calls.lock().unwrap().is_empty());

        assert_eq!(manager.tick(&mut registry, &files), 1);
        assert!(!manager.is_pending(id));
        assert_eq!(manager.tick(&mut registry, &files), 0);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_request_completes() {
        let files = PlatformFileChain::default();
        let mut registry = ObjectRegistry::new(Box::new(FakePackages));
        let mut manager = StreamableManager::new(1);
        let (calls, callback) = recorder();

        manager.request(vec![], callback);
        assert_eq!(manager.tick(&mut registry, &files), 1);
        assert_eq!(manager.pending_requests(), 0);
        assert!(calls.lock().unwrap()[0].classes.is_empty());
    }
}
