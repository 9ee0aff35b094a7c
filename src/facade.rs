//! The public surface: [`Cube`] and [`CubeBuilder`]. Classifies each call
//! into `(direction, plane)` or the snapshot group, drives the controller's
//! entry/exit protocol, and invokes the caller's hooks in between.

use std::convert::Infallible;
use std::sync::Mutex;

use crate::controller::{CancelToken, Cancelled, Controller, SNAPSHOT_GROUP};
use crate::error::CubeError;
use crate::geometry;

type RotateHook<E> = Box<dyn Fn(u8, usize) -> Result<(), E> + Send + Sync>;
type ShowHook<E> = Box<dyn Fn() -> Result<(), E> + Send + Sync>;

struct Hooks<E> {
    before_rotate: RotateHook<E>,
    after_rotate: RotateHook<E>,
    before_show: ShowHook<E>,
    after_show: ShowHook<E>,
}

impl<E> Hooks<E> {
    fn noop() -> Self {
        Hooks {
            before_rotate: Box::new(|_, _| Ok(())),
            after_rotate: Box::new(|_, _| Ok(())),
            before_show: Box::new(|| Ok(())),
            after_show: Box::new(|| Ok(())),
        }
    }
}

/// Typed, defaultable construction surface for a [`Cube`]. Every hook
/// defaults to a no-op; `E` is whatever error type the caller's hooks
/// return, surfaced verbatim through [`CubeError::Hook`].
pub struct CubeBuilder<E = Infallible> {
    size: usize,
    hooks: Hooks<E>,
}

impl<E> CubeBuilder<E> {
    pub fn new(size: usize) -> Self {
        CubeBuilder {
            size,
            hooks: Hooks::noop(),
        }
    }

    /// Invoked synchronously, with the admission already held, just before
    /// the geometry mutation of an admitted rotation.
    pub fn before_rotate(
        mut self,
        hook: impl Fn(u8, usize) -> Result<(), E> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.before_rotate = Box::new(hook);
        self
    }

    /// Invoked synchronously just after the geometry mutation, still under
    /// admission.
    pub fn after_rotate(
        mut self,
        hook: impl Fn(u8, usize) -> Result<(), E> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.after_rotate = Box::new(hook);
        self
    }

    /// Invoked synchronously, under snapshot admission, before the faces
    /// are read.
    pub fn before_show(
        mut self,
        hook: impl Fn() -> Result<(), E> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.before_show = Box::new(hook);
        self
    }

    /// Invoked synchronously, under snapshot admission, after the faces
    /// are read.
    pub fn after_show(mut self, hook: impl Fn() -> Result<(), E> + Send + Sync + 'static) -> Self {
        self.hooks.after_show = Box::new(hook);
        self
    }

    pub fn build(self) -> Cube<E> {
        Cube {
            size: self.size,
            geometry: Mutex::new(geometry::Cube::new(self.size)),
            controller: Controller::new(self.size),
            hooks: self.hooks,
        }
    }
}

/// RAII guard for an admitted rotation. Releases the plane gate (if
/// acquired) and always runs the controller's exit protocol on drop, so the
/// admission is released on every return path -- success, hook failure, or
/// cancellation -- without the caller having to remember to call anything.
struct RotationPermit<'a> {
    controller: &'a Controller,
    group: usize,
    plane: usize,
    plane_held: bool,
}

impl Drop for RotationPermit<'_> {
    fn drop(&mut self) {
        if self.plane_held {
            self.controller.release_plane(self.plane);
        }
        self.controller.exit(self.group);
    }
}

/// RAII guard for an admitted snapshot.
struct SnapshotPermit<'a> {
    controller: &'a Controller,
}

impl Drop for SnapshotPermit<'_> {
    fn drop(&mut self) {
        self.controller.exit(SNAPSHOT_GROUP);
    }
}

/// A concurrent $N \times N \times N$ Rubik's cube. Cheap to share behind an
/// `Arc`; every method takes `&self` and internally serializes/parallelizes
/// per the conflict-group rules the controller enforces.
pub struct Cube<E = Infallible> {
    size: usize,
    geometry: Mutex<geometry::Cube>,
    controller: Controller,
    hooks: Hooks<E>,
}

impl<E> std::fmt::Debug for Cube<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cube").field("size", &self.size).finish_non_exhaustive()
    }
}

impl<E> Cube<E> {
    /// The zero-hook convenience constructor.
    pub fn new(size: usize) -> Self {
        CubeBuilder::new(size).build()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn classify(&self, face: u8, layer: usize) -> Result<(u8, usize), CubeError<E>> {
        if usize::from(face) >= geometry::FACE_COUNT {
            return Err(CubeError::FaceOutOfRange(face));
        }
        if layer >= self.size {
            return Err(CubeError::LayerOutOfRange(layer));
        }
        let direction = geometry::direction(face);
        let plane = geometry::plane(face, layer, self.size);
        Ok((direction, plane))
    }

    /// Rotates `(face, layer)` one clockwise quarter turn, with no
    /// cancellation path. Equivalent to [`Cube::rotate_with`] with a token
    /// that is never cancelled.
    pub fn rotate(&self, face: u8, layer: usize) -> Result<(), CubeError<E>> {
        self.rotate_with(face, layer, &CancelToken::new())
    }

    /// Rotates `(face, layer)` one clockwise quarter turn. Cancellable via
    /// `cancel`: if cancellation is observed before admission or while
    /// waiting for the plane gate, no geometry mutation occurs.
    pub fn rotate_with(
        &self,
        face: u8,
        layer: usize,
        cancel: &CancelToken,
    ) -> Result<(), CubeError<E>> {
        let (direction, plane) = self.classify(face, layer)?;
        let group = usize::from(direction);

        self.controller
            .enter(group, cancel)
            .map_err(|Cancelled| CubeError::Cancelled)?;
        let mut permit = RotationPermit {
            controller: &self.controller,
            group,
            plane,
            plane_held: false,
        };

        self.controller
            .acquire_plane(plane, cancel)
            .map_err(|Cancelled| CubeError::Cancelled)?;
        permit.plane_held = true;

        (self.hooks.before_rotate)(face, layer).map_err(CubeError::Hook)?;
        self.geometry.lock().unwrap().rotate_layer(face, layer);
        (self.hooks.after_rotate)(face, layer).map_err(CubeError::Hook)?;

        Ok(())
    }

    /// Reads every face into a `6*size*size`-character string (empty when
    /// `size == 0`), with no cancellation path.
    pub fn snapshot(&self) -> Result<String, CubeError<E>> {
        self.snapshot_with(&CancelToken::new())
    }

    /// Cancellable counterpart of [`Cube::snapshot`].
    pub fn snapshot_with(&self, cancel: &CancelToken) -> Result<String, CubeError<E>> {
        self.controller
            .enter(SNAPSHOT_GROUP, cancel)
            .map_err(|Cancelled| CubeError::Cancelled)?;
        let _permit = SnapshotPermit {
            controller: &self.controller,
        };

        (self.hooks.before_show)().map_err(CubeError::Hook)?;
        let snapshot = self.geometry.lock().unwrap().snapshot();
        (self.hooks.after_show)().map_err(CubeError::Hook)?;

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_rotations_then_snapshot_matches_the_exact_digit_string() {
        let cube: Cube = Cube::new(3);
        cube.rotate(3, 0).unwrap();
        cube.rotate(0, 1).unwrap();
        let snap = cube.snapshot().unwrap();
        assert_eq!(
            snap,
            "002002002111225111225333225333044333044111044554554554"
        );
    }

    #[test]
    fn opposite_face_same_plane_rotation_cancels_through_facade() {
        let cube: Cube = Cube::new(3);
        let initial = cube.snapshot().unwrap();
        cube.rotate(0, 0).unwrap();
        cube.rotate(5, 2).unwrap();
        assert_eq!(cube.snapshot().unwrap(), initial);
    }

    #[test]
    fn empty_cube_snapshot_is_empty_string() {
        let cube: Cube = Cube::new(0);
        assert_eq!(cube.snapshot().unwrap(), "");
    }

    #[test]
    fn out_of_range_face_is_a_checked_error() {
        let cube: Cube = Cube::new(3);
        assert!(matches!(
            cube.rotate(6, 0),
            Err(CubeError::FaceOutOfRange(6))
        ));
    }

    #[test]
    fn out_of_range_layer_is_a_checked_error() {
        let cube: Cube = Cube::new(3);
        assert!(matches!(
            cube.rotate(0, 3),
            Err(CubeError::LayerOutOfRange(3))
        ));
    }

    #[test]
    fn n_zero_rotation_is_always_out_of_range() {
        let cube: Cube = Cube::new(0);
        assert!(matches!(
            cube.rotate(0, 0),
            Err(CubeError::LayerOutOfRange(0))
        ));
    }

    #[test]
    fn hooks_run_exactly_once_per_admitted_rotation() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let before2 = Arc::clone(&before);
        let after2 = Arc::clone(&after);

        let cube: Cube = CubeBuilder::new(3)
            .before_rotate(move |_, _| {
                before2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .after_rotate(move |_, _| {
                after2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build();

        cube.rotate(0, 0).unwrap();
        cube.rotate(1, 1).unwrap();

        assert_eq!(before.load(Ordering::SeqCst), 2);
        assert_eq!(after.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn hook_failure_is_propagated_and_still_releases_admission() {
        let cube: Cube<&'static str> = CubeBuilder::new(3)
            .before_rotate(|_, _| Err("nope"))
            .build();

        assert!(matches!(cube.rotate(0, 0), Err(CubeError::Hook("nope"))));
        // Admission was released by the guard despite the hook failing, so
        // a subsequent call is not blocked forever.
        let cube: Cube<&'static str> = CubeBuilder::new(3).build();
        cube.rotate(0, 0).unwrap();
    }

    #[test]
    fn cancellation_while_blocked_touches_no_geometry() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let cube: Arc<Cube> = Arc::new(
            CubeBuilder::new(3)
                .before_show(|| {
                    thread::sleep(Duration::from_millis(60));
                    Ok(())
                })
                .build(),
        );
        let before = cube.snapshot().unwrap();

        let holder = Arc::clone(&cube);
        let handle = thread::spawn(move || holder.snapshot().unwrap());
        thread::sleep(Duration::from_millis(15));

        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            cube.rotate_with(0, 0, &token),
            Err(CubeError::Cancelled)
        ));

        handle.join().unwrap();
        assert_eq!(cube.snapshot().unwrap(), before);
    }
}
