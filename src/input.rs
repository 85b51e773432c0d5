//! Action-system passthrough.
//!
//! Input remapping is handled outside the compositor core; the runtime still
//! interns action sets and actions so applications can run their setup path,
//! but every state query reports an inactive source and the interaction
//! profile stays null.

use {
    crate::{
        error::{RuntimeError, RuntimeResult},
        handles::HandleTable,
    },
    openxr_sys as sys,
};

/// One `XrActionSet`.
#[derive(Debug)]
pub struct ActionSet {
    pub name: String,
    pub localized_name: String,
    pub priority: u32,
    pub attached: bool,
}

/// One `XrAction`.
#[derive(Debug)]
pub struct Action {
    pub name: String,
    pub localized_name: String,
    pub ty: sys::ActionType,
    pub action_set: u64,
    pub subaction_paths: Vec<sys::Path>,
}

/// Instance-scope input entities.
#[derive(Debug, Default)]
pub struct InputState {
    pub action_sets: HandleTable<ActionSet>,
    pub actions: HandleTable<Action>,
    pub suggested_bindings: Vec<(sys::Path, usize)>,
    profile_changed_pending: bool,
}

/// Validates the `[a-z0-9-_.]` identifier rule shared by action and
/// action-set names.
fn is_well_formed_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_.".contains(c))
}

impl InputState {
    pub fn create_action_set(
        &mut self,
        name: &str,
        localized_name: &str,
        priority: u32,
    ) -> RuntimeResult<u64> {
        if !is_well_formed_name(name) || localized_name.is_empty() {
            return Err(RuntimeError::PathInvalid);
        }

        if self.action_sets.values().any(|set| set.name == name) {
            return Err(RuntimeError::NameDuplicated);
        }

        Ok(self.action_sets.insert(ActionSet {
            name: name.to_owned(),
            localized_name: localized_name.to_owned(),
            priority,
            attached: false,
        }))
    }

    pub fn create_action(
        &mut self,
        action_set: u64,
        name: &str,
        localized_name: &str,
        ty: sys::ActionType,
        subaction_paths: Vec<sys::Path>,
    ) -> RuntimeResult<u64> {
        if !self.action_sets.contains(action_set) {
            return Err(RuntimeError::HandleInvalid);
        }

        if !is_well_formed_name(name) || localized_name.is_empty() {
            return Err(RuntimeError::PathInvalid);
        }

        Ok(self.actions.insert(Action {
            name: name.to_owned(),
            localized_name: localized_name.to_owned(),
            ty,
            action_set,
            subaction_paths,
        }))
    }

    pub fn destroy_action_set(&mut self, handle: u64) -> RuntimeResult<()> {
        self.action_sets
            .remove(handle)
            .map(|_| ())
            .ok_or(RuntimeError::HandleInvalid)
    }

    pub fn destroy_action(&mut self, handle: u64) -> RuntimeResult<()> {
        self.actions
            .remove(handle)
            .map(|_| ())
            .ok_or(RuntimeError::HandleInvalid)
    }

    pub fn action(&self, handle: u64) -> RuntimeResult<&Action> {
        self.actions.get(handle).ok_or(RuntimeError::HandleInvalid)
    }

    /// `xrSuggestInteractionProfileBindings`: recorded, not acted upon.
    pub fn suggest_bindings(&mut self, profile: sys::Path, count: usize) -> RuntimeResult<()> {
        self.suggested_bindings.push((profile, count));

        Ok(())
    }

    /// `xrAttachSessionActionSets`.
    pub fn attach(&mut self, handles: &[u64]) -> RuntimeResult<()> {
        for handle in handles {
            if !self.action_sets.contains(*handle) {
                return Err(RuntimeError::HandleInvalid);
            }
        }

        for handle in handles {
            if let Some(set) = self.action_sets.get_mut(*handle) {
                set.attached = true;
            }
        }

        Ok(())
    }

    pub fn take_profile_changed(&mut self) -> bool {
        std::mem::take(&mut self.profile_changed_pending)
    }
}
