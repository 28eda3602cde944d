//! Shared world objects updated on the game-frame clock.
//!
//! World objects live on the server rather than in connection states so the
//! whole set is advanced by a single writer; states read into it through the
//! handle to refresh their own view of the world.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

/// An object that belongs to the game world but not to any connection, such
/// as a projectile or a spawner. `update` runs every game frame and should
/// stay lightweight.
pub trait WorldObject: Send + 'static {
    /// Advances the object by `delta` seconds of game time.
    fn update(&mut self, delta: f64);

    /// Freed objects are reaped between frames.
    fn freed(&self) -> bool {
        false
    }

    /// Unique kinds keep at most one live instance; adding another replaces
    /// the existing one.
    fn unique(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Default)]
struct WorldObjects {
    objects: Vec<Box<dyn WorldObject>>,
    unique: HashMap<TypeId, usize>,
}

impl WorldObjects {
    fn add(&mut self, object: Box<dyn WorldObject>) {
        if object.unique() {
            let tid = object.as_any().type_id();
            if let Some(&index) = self.unique.get(&tid) {
                self.objects[index] = object;
                return;
            }
            self.unique.insert(tid, self.objects.len());
        }
        self.objects.push(object);
    }

    fn update_all(&mut self, delta: f64) {
        for object in &mut self.objects {
            object.update(delta);
        }
        self.reap();
    }

    fn reap(&mut self) {
        if self.objects.iter().any(|object| object.freed()) {
            self.objects.retain(|object| !object.freed());
            self.reindex();
        }
    }

    fn reindex(&mut self) {
        self.unique.clear();
        for (index, object) in self.objects.iter().enumerate() {
            if object.unique() {
                self.unique.insert(object.as_any().type_id(), index);
            }
        }
    }

    fn unique_index<T: WorldObject>(&self) -> Option<usize> {
        self.unique.get(&TypeId::of::<T>()).copied()
    }
}

/// Cloneable handle to the world object set. All access is serialized.
#[derive(Clone, Default)]
pub struct WorldHandle {
    inner: Arc<Mutex<WorldObjects>>,
}

impl WorldHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, object: impl WorldObject) {
        self.inner.lock().await.add(Box::new(object));
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Advances every object and reaps freed ones. Called by the game-frame
    /// loop; exposed so tests can drive frames directly.
    pub async fn update_all(&self, delta: f64) {
        self.inner.lock().await.update_all(delta);
    }

    /// Reads the unique instance of `T`, if one is live.
    pub async fn with_unique<T, R>(&self, read: impl FnOnce(&T) -> R) -> Option<R>
    where
        T: WorldObject,
    {
        let world = self.inner.lock().await;
        let index = world.unique_index::<T>()?;
        world.objects[index].as_any().downcast_ref().map(read)
    }

    /// Mutates the unique instance of `T`, if one is live.
    pub async fn with_unique_mut<T, R>(&self, write: impl FnOnce(&mut T) -> R) -> Option<R>
    where
        T: WorldObject,
    {
        let mut world = self.inner.lock().await;
        let index = world.unique_index::<T>()?;
        world.objects[index].as_any_mut().downcast_mut().map(write)
    }

    /// Drops the unique instance of `T`. Returns whether one existed.
    pub async fn remove_unique<T: WorldObject>(&self) -> bool {
        let mut world = self.inner.lock().await;
        match world.unique_index::<T>() {
            Some(index) => {
                world.objects.remove(index);
                world.reindex();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Projectile {
        travelled: f64,
        range: f64,
    }

    impl WorldObject for Projectile {
        fn update(&mut self, delta: f64) {
            self.travelled += delta * 10.0;
        }

        fn freed(&self) -> bool {
            self.travelled >= self.range
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Weather {
        intensity: u32,
    }

    impl WorldObject for Weather {
        fn update(&mut self, _delta: f64) {}

        fn unique(&self) -> bool {
            true
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn unique_kind_keeps_only_the_newest_instance() {
        let world = WorldHandle::new();
        world.add(Weather { intensity: 1 }).await;
        world.add(Weather { intensity: 9 }).await;

        assert_eq!(world.len().await, 1);
        let intensity = world.with_unique(|w: &Weather| w.intensity).await;
        assert_eq!(intensity, Some(9));
    }

    #[tokio::test]
    async fn non_unique_objects_accumulate() {
        let world = WorldHandle::new();
        world
            .add(Projectile {
                travelled: 0.0,
                range: 100.0,
            })
            .await;
        world
            .add(Projectile {
                travelled: 0.0,
                range: 100.0,
            })
            .await;
        assert_eq!(world.len().await, 2);
    }

    #[tokio::test]
    async fn freed_objects_are_reaped_after_a_frame() {
        let world = WorldHandle::new();
        world
            .add(Projectile {
                travelled: 0.0,
                range: 1.0,
            })
            .await;
        world.add(Weather { intensity: 3 }).await;

        world.update_all(0.05).await;
        assert_eq!(world.len().await, 2);

        world.update_all(0.1).await;
        assert_eq!(world.len().await, 1);
        // The unique lookup survives compaction.
        assert_eq!(world.with_unique(|w: &Weather| w.intensity).await, Some(3));
    }

    #[tokio::test]
    async fn remove_unique_clears_the_slot() {
        let world = WorldHandle::new();
        world.add(Weather { intensity: 2 }).await;
        assert!(world.remove_unique::<Weather>().await);
        assert!(!world.remove_unique::<Weather>().await);
        assert!(world.is_empty().await);
    }

    #[tokio::test]
    async fn update_advances_every_object() {
        let world = WorldHandle::new();
        world
            .add(Projectile {
                travelled: 0.0,
                range: 100.0,
            })
            .await;
        world.update_all(0.5).await;
        world.update_all(0.5).await;

        // 10 units/sec over one second of frames.
        let travelled = world
            .inner
            .lock()
            .await
            .objects
            .first()
            .and_then(|o| o.as_any().downcast_ref::<Projectile>().map(|p| p.travelled))
            .unwrap();
        assert!((travelled - 10.0).abs() < 1e-9);
    }
}
