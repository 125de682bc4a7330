//! In-memory formation/device state store.
//!
//! Two-level mapping: formation → shared state, formation → device →
//! per-device state, plus a reverse index from device name to formation id
//! (populated when a device first registers state). Values are stored as
//! `Arc<dyn Any>` and read back with typed downcasts; a missing formation,
//! device, or key is `None`, never an error.
//!
//! Single operations lock per call. Handlers that read-modify-write acquire
//! a guard via [`FormationStore::write`] and perform the whole sequence on
//! it. Guards must not be held across `.await` points.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Cancellation handle for a device's up-state publisher task.
pub type UpCancel = oneshot::Sender<()>;

type StateValue = Arc<dyn Any + Send + Sync>;
type StateMap = HashMap<String, StateValue>;

#[derive(Default)]
struct DeviceEntry {
    state: StateMap,
    // Dedicated slot instead of an entry in the generic state map: the
    // handle is taken exactly once, on disconnect.
    cancel_up: Option<UpCancel>,
}

#[derive(Default)]
struct FormationEntry {
    state: StateMap,
    devices: HashMap<String, DeviceEntry>,
}

#[derive(Default)]
struct Inner {
    formations: HashMap<String, FormationEntry>,
    formation_by_device: HashMap<String, String>,
}

impl Inner {
    fn put_state<T: Any + Send + Sync>(&mut self, formation_id: &str, key: &str, value: T) {
        let formation = self.formations.entry(formation_id.to_string()).or_default();
        formation.state.insert(key.to_string(), Arc::new(value));
    }

    fn get_state<T: Any + Send + Sync>(&self, formation_id: &str, key: &str) -> Option<Arc<T>> {
        let value = self.formations.get(formation_id)?.state.get(key)?;
        value.clone().downcast::<T>().ok()
    }

    fn put_device_state<T: Any + Send + Sync>(
        &mut self,
        formation_id: &str,
        device_name: &str,
        key: &str,
        value: T,
    ) {
        self.add_device(device_name, formation_id);
        let formation = self.formations.entry(formation_id.to_string()).or_default();
        let device = formation.devices.entry(device_name.to_string()).or_default();
        device.state.insert(key.to_string(), Arc::new(value));
    }

    fn get_device_state<T: Any + Send + Sync>(
        &self,
        device_name: &str,
        key: &str,
    ) -> Option<Arc<T>> {
        let formation_id = self.formation_by_device.get(device_name)?;
        let formation = self.formations.get(formation_id)?;
        let value = formation.devices.get(device_name)?.state.get(key)?;
        value.clone().downcast::<T>().ok()
    }

    fn delete_device_state(&mut self, formation_id: &str, device_name: &str, key: &str) {
        if let Some(formation) = self.formations.get_mut(formation_id) {
            if let Some(device) = formation.devices.get_mut(device_name) {
                device.state.remove(key);
            }
        }
    }

    fn formation_id(&self, device_name: &str) -> Option<String> {
        self.formation_by_device.get(device_name).cloned()
    }

    fn add_device(&mut self, device_name: &str, formation_id: &str) {
        self.formation_by_device
            .insert(device_name.to_string(), formation_id.to_string());
    }

    fn put_up_cancel(&mut self, formation_id: &str, device_name: &str, cancel: UpCancel) {
        self.add_device(device_name, formation_id);
        let formation = self.formations.entry(formation_id.to_string()).or_default();
        let device = formation.devices.entry(device_name.to_string()).or_default();
        device.cancel_up = Some(cancel);
    }

    fn take_up_cancel(&mut self, device_name: &str) -> Option<UpCancel> {
        let formation_id = self.formation_by_device.get(device_name)?.clone();
        let formation = self.formations.get_mut(&formation_id)?;
        formation.devices.get_mut(device_name)?.cancel_up.take()
    }
}

/// Shared state for all formations and their devices.
///
/// A device's entry persists across reconnects so that accumulating state
/// (ping statistics in particular) carries over; there is no whole-formation
/// garbage collection.
#[derive(Default)]
pub struct FormationStore {
    inner: RwLock<Inner>,
}

impl FormationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the write lock for a multi-step read-modify-write.
    pub fn write(&self) -> StoreWriteGuard<'_> {
        StoreWriteGuard(self.inner.write())
    }

    /// Take the read lock for multi-step reads.
    pub fn read(&self) -> StoreReadGuard<'_> {
        StoreReadGuard(self.inner.read())
    }

    pub fn put_state<T: Any + Send + Sync>(&self, formation_id: &str, key: &str, value: T) {
        self.inner.write().put_state(formation_id, key, value);
    }

    pub fn get_state<T: Any + Send + Sync>(&self, formation_id: &str, key: &str) -> Option<Arc<T>> {
        self.inner.read().get_state(formation_id, key)
    }

    /// Store a per-device value, creating the formation/device entries as
    /// needed and pointing the reverse index at the formation.
    pub fn put_device_state<T: Any + Send + Sync>(
        &self,
        formation_id: &str,
        device_name: &str,
        key: &str,
        value: T,
    ) {
        self.inner
            .write()
            .put_device_state(formation_id, device_name, key, value);
    }

    /// Look up a per-device value through the reverse index.
    pub fn get_device_state<T: Any + Send + Sync>(
        &self,
        device_name: &str,
        key: &str,
    ) -> Option<Arc<T>> {
        self.inner.read().get_device_state(device_name, key)
    }

    pub fn delete_device_state(&self, formation_id: &str, device_name: &str, key: &str) {
        self.inner
            .write()
            .delete_device_state(formation_id, device_name, key);
    }

    pub fn formation_id(&self, device_name: &str) -> Option<String> {
        self.inner.read().formation_id(device_name)
    }

    pub fn add_device(&self, device_name: &str, formation_id: &str) {
        self.inner.write().add_device(device_name, formation_id);
    }

    pub fn put_up_cancel(&self, formation_id: &str, device_name: &str, cancel: UpCancel) {
        self.inner
            .write()
            .put_up_cancel(formation_id, device_name, cancel);
    }

    pub fn take_up_cancel(&self, device_name: &str) -> Option<UpCancel> {
        self.inner.write().take_up_cancel(device_name)
    }
}

/// Write access to the store for composite updates.
pub struct StoreWriteGuard<'a>(RwLockWriteGuard<'a, Inner>);

impl StoreWriteGuard<'_> {
    pub fn put_state<T: Any + Send + Sync>(&mut self, formation_id: &str, key: &str, value: T) {
        self.0.put_state(formation_id, key, value);
    }

    pub fn get_state<T: Any + Send + Sync>(&self, formation_id: &str, key: &str) -> Option<Arc<T>> {
        self.0.get_state(formation_id, key)
    }

    pub fn put_device_state<T: Any + Send + Sync>(
        &mut self,
        formation_id: &str,
        device_name: &str,
        key: &str,
        value: T,
    ) {
        self.0.put_device_state(formation_id, device_name, key, value);
    }

    pub fn get_device_state<T: Any + Send + Sync>(
        &self,
        device_name: &str,
        key: &str,
    ) -> Option<Arc<T>> {
        self.0.get_device_state(device_name, key)
    }

    pub fn delete_device_state(&mut self, formation_id: &str, device_name: &str, key: &str) {
        self.0.delete_device_state(formation_id, device_name, key);
    }

    pub fn formation_id(&self, device_name: &str) -> Option<String> {
        self.0.formation_id(device_name)
    }

    pub fn add_device(&mut self, device_name: &str, formation_id: &str) {
        self.0.add_device(device_name, formation_id);
    }
}

/// Read access to the store for composite reads.
pub struct StoreReadGuard<'a>(RwLockReadGuard<'a, Inner>);

impl StoreReadGuard<'_> {
    pub fn get_state<T: Any + Send + Sync>(&self, formation_id: &str, key: &str) -> Option<Arc<T>> {
        self.0.get_state(formation_id, key)
    }

    pub fn get_device_state<T: Any + Send + Sync>(
        &self,
        device_name: &str,
        key: &str,
    ) -> Option<Arc<T>> {
        self.0.get_device_state(device_name, key)
    }

    pub fn formation_id(&self, device_name: &str) -> Option<String> {
        self.0.formation_id(device_name)
    }
}
