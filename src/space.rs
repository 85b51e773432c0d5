//! Reference and action spaces, and the pose math that relates them.
//!
//! Three reference space types exist: VIEW (the headset), LOCAL (the seated
//! origin captured at session start) and STAGE (floor-relative, offset by
//! the configured eye height). Locating one space in another composes the
//! creation-time pose offsets around the tracked headset pose.

use {
    crate::{
        backend::Backend,
        error::{RuntimeError, RuntimeResult},
    },
    glam::{Quat, Vec3},
    openxr_sys as sys,
};

/// A rigid transform mapping local coordinates into parent coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    pub rotation: Quat,
    pub translation: Vec3,
}

impl Pose {
    pub const IDENTITY: Self = Self {
        rotation: Quat::IDENTITY,
        translation: Vec3::ZERO,
    };

    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            rotation: Quat::IDENTITY,
            translation,
        }
    }

    /// Composes two transforms: the result applies `self` first, `next`
    /// second.
    pub fn then(self, next: Self) -> Self {
        Self {
            rotation: (next.rotation * self.rotation).normalize(),
            translation: next.rotation * self.translation + next.translation,
        }
    }

    pub fn inverse(self) -> Self {
        let rotation = self.rotation.conjugate();

        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    pub fn from_xr(pose: sys::Posef) -> Self {
        Self {
            rotation: Quat::from_xyzw(
                pose.orientation.x,
                pose.orientation.y,
                pose.orientation.z,
                pose.orientation.w,
            )
            .normalize(),
            translation: Vec3::new(pose.position.x, pose.position.y, pose.position.z),
        }
    }

    pub fn to_xr(self) -> sys::Posef {
        sys::Posef {
            orientation: sys::Quaternionf {
                x: self.rotation.x,
                y: self.rotation.y,
                z: self.rotation.z,
                w: self.rotation.w,
            },
            position: sys::Vector3f {
                x: self.translation.x,
                y: self.translation.y,
                z: self.translation.z,
            },
        }
    }

    /// Rejects NaN/inf poses and denormalized quaternions from the caller.
    pub fn validate_xr(pose: &sys::Posef) -> RuntimeResult<Self> {
        let q = Quat::from_xyzw(
            pose.orientation.x,
            pose.orientation.y,
            pose.orientation.z,
            pose.orientation.w,
        );
        let p = Vec3::new(pose.position.x, pose.position.y, pose.position.z);

        if !q.is_finite() || !p.is_finite() || (q.length_squared() - 1.0).abs() > 0.01 {
            return Err(RuntimeError::Validation);
        }

        Ok(Self {
            rotation: q.normalize(),
            translation: p,
        })
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// What a space is anchored to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SpaceKind {
    Reference(sys::ReferenceSpaceType),

    /// Action spaces are accepted but resolve to empty location flags while
    /// the input system is a passthrough.
    Action {
        action: u64,
        subaction_path: sys::Path,
    },
}

/// An application-created space. Immutable after creation.
#[derive(Clone, Copy, Debug)]
pub struct Space {
    pub kind: SpaceKind,
    pub pose_in_space: Pose,
}

impl Space {
    pub fn reference(ty: sys::ReferenceSpaceType, pose_in_space: Pose) -> Self {
        Self {
            kind: SpaceKind::Reference(ty),
            pose_in_space,
        }
    }

    fn reference_type(&self) -> Option<sys::ReferenceSpaceType> {
        match self.kind {
            SpaceKind::Reference(ty) => Some(ty),
            SpaceKind::Action { .. } => None,
        }
    }
}

/// A located pose plus its validity flags.
#[derive(Clone, Copy, Debug)]
pub struct Location {
    pub flags: sys::SpaceLocationFlags,
    pub pose: Pose,
}

impl Location {
    const EMPTY: Self = Self {
        flags: sys::SpaceLocationFlags::EMPTY,
        pose: Pose::IDENTITY,
    };
}

fn tracked_flags() -> sys::SpaceLocationFlags {
    sys::SpaceLocationFlags::from_raw(
        sys::SpaceLocationFlags::ORIENTATION_VALID.into_raw()
            | sys::SpaceLocationFlags::ORIENTATION_TRACKED.into_raw()
            | sys::SpaceLocationFlags::POSITION_VALID.into_raw()
            | sys::SpaceLocationFlags::POSITION_TRACKED.into_raw(),
    )
}

/// Locates `space` in `base` at the given backend time.
pub fn locate(
    space: &Space,
    base: &Space,
    time: f64,
    backend: &dyn Backend,
    floor_height: f32,
) -> Location {
    let (Some(space_ty), Some(base_ty)) = (space.reference_type(), base.reference_type()) else {
        // Action spaces resolve to nothing until the input system is real.
        return Location::EMPTY;
    };

    let view = sys::ReferenceSpaceType::VIEW;
    let stage = sys::ReferenceSpaceType::STAGE;
    let stage_on_one_side = (space_ty == stage) != (base_ty == stage);

    let mut flags = sys::SpaceLocationFlags::EMPTY;
    let mut middle = Pose::IDENTITY;

    if (space_ty == view || base_ty == view) && space_ty != base_ty {
        let state = backend.hmd_pose_state(time);
        middle = state.pose;

        if state.orientation_tracked {
            flags |= sys::SpaceLocationFlags::ORIENTATION_VALID
                | sys::SpaceLocationFlags::ORIENTATION_TRACKED;
        }

        // 3-DoF setups still report a synthesized position; propagate the
        // orientation bit the way the tracker does.
        if state.position_tracked || state.orientation_tracked {
            flags |= sys::SpaceLocationFlags::POSITION_VALID
                | sys::SpaceLocationFlags::POSITION_TRACKED;
        }

        // The tracker reports headset poses relative to the seated origin;
        // express them floor-relative when STAGE is on either side.
        if stage_on_one_side {
            middle.translation.y += floor_height;
        }

        if base_ty == view {
            middle = middle.inverse();
        }
    } else {
        flags = tracked_flags();

        if stage_on_one_side {
            middle.translation.y += if base_ty == stage {
                floor_height
            } else {
                -floor_height
            };
        }
    }

    Location {
        flags,
        pose: space
            .pose_in_space
            .then(middle)
            .then(base.pose_in_space.inverse()),
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::backend::{mock::MockHmd, PoseState},
        glam::vec3,
    };

    fn local() -> Space {
        Space::reference(sys::ReferenceSpaceType::LOCAL, Pose::IDENTITY)
    }

    fn stage() -> Space {
        Space::reference(sys::ReferenceSpaceType::STAGE, Pose::IDENTITY)
    }

    fn view() -> Space {
        Space::reference(sys::ReferenceSpaceType::VIEW, Pose::IDENTITY)
    }

    #[test]
    pub fn pose_then_inverse_roundtrip() {
        let a = Pose {
            rotation: Quat::from_rotation_y(0.7),
            translation: vec3(1.0, 2.0, 3.0),
        };

        let id = a.then(a.inverse());

        assert!(id.translation.length() < 1e-5);
        assert!(id.rotation.angle_between(Quat::IDENTITY) < 1e-5);
    }

    #[test]
    pub fn local_in_local_is_identity() {
        let hmd = MockHmd::default();
        let loc = locate(&local(), &local(), 0.0, &hmd, 1.7);

        assert_eq!(loc.flags, tracked_flags());
        assert!(loc.pose.translation.length() < 1e-6);
    }

    #[test]
    pub fn stage_sits_below_local() {
        let hmd = MockHmd::default();

        // The stage origin is on the floor, eye-height below the seated
        // origin.
        let loc = locate(&stage(), &local(), 0.0, &hmd, 1.7);
        assert!((loc.pose.translation.y - -1.7).abs() < 1e-6);

        let loc = locate(&local(), &stage(), 0.0, &hmd, 1.7);
        assert!((loc.pose.translation.y - 1.7).abs() < 1e-6);
    }

    #[test]
    pub fn view_in_stage_adds_floor_height() {
        let hmd = MockHmd::default();
        hmd.set_hmd_pose(PoseState {
            pose: Pose::from_translation(vec3(0.0, 0.1, 0.0)),
            orientation_tracked: true,
            position_tracked: true,
        });

        let loc = locate(&view(), &stage(), 0.0, &hmd, 1.7);

        assert!((loc.pose.translation.y - 1.8).abs() < 1e-6);
        assert!(loc
            .flags
            .contains(sys::SpaceLocationFlags::POSITION_TRACKED));
    }

    #[test]
    pub fn view_as_base_inverts() {
        let hmd = MockHmd::default();
        hmd.set_hmd_pose(PoseState {
            pose: Pose::from_translation(vec3(0.0, 0.0, -2.0)),
            orientation_tracked: true,
            position_tracked: true,
        });

        let loc = locate(&local(), &view(), 0.0, &hmd, 1.7);

        assert!((loc.pose.translation.z - 2.0).abs() < 1e-6);
    }

    #[test]
    pub fn untracked_orientation_clears_flags() {
        let hmd = MockHmd::default();
        hmd.set_hmd_pose(PoseState {
            pose: Pose::IDENTITY,
            orientation_tracked: false,
            position_tracked: false,
        });

        let loc = locate(&view(), &local(), 0.0, &hmd, 1.7);

        assert_eq!(loc.flags, sys::SpaceLocationFlags::EMPTY);
    }

    #[test]
    pub fn action_space_resolves_empty() {
        let hmd = MockHmd::default();
        let action_space = Space {
            kind: SpaceKind::Action {
                action: 1,
                subaction_path: sys::Path::from_raw(0),
            },
            pose_in_space: Pose::IDENTITY,
        };

        let loc = locate(&action_space, &local(), 0.0, &hmd, 1.7);

        assert_eq!(loc.flags, sys::SpaceLocationFlags::EMPTY);
    }
}
