//! Feedback Texture Set - textures sampled together with the same UVs
//!
//! Only the primary texture of a set captures and decodes feedback; the other
//! members follow the primary's requests. Membership is non-owning in both
//! directions.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::feedback_texture::{FeedbackTexture, TextureInner};
use super::tile::TiledTextureId;

struct SetMember {
    texture: Weak<TextureInner>,
    id: TiledTextureId,
}

#[derive(Default)]
struct SetState {
    members: Vec<SetMember>,
    primary_index: usize,
}

#[derive(Default)]
pub(crate) struct SetInner {
    state: RefCell<SetState>,
}

impl SetInner {
    pub(crate) fn is_primary(&self, texture: *const TextureInner) -> bool {
        let state = self.state.borrow();
        state
            .members
            .get(state.primary_index)
            .is_some_and(|m| m.texture.as_ptr() == texture)
    }

    pub(crate) fn member_ids(&self) -> Vec<TiledTextureId> {
        self.state.borrow().members.iter().map(|m| m.id).collect()
    }

    /// Remove a member, keeping the primary on the same texture when it survives
    pub(crate) fn forget_member(&self, texture: *const TextureInner) -> bool {
        let mut state = self.state.borrow_mut();
        let Some(pos) = state.members.iter().position(|m| m.texture.as_ptr() == texture) else {
            return false;
        };
        state.members.remove(pos);
        if pos < state.primary_index {
            state.primary_index -= 1;
        }
        if state.primary_index >= state.members.len() {
            state.primary_index = 0;
        }
        true
    }

    /// Recompute readback eligibility of every member
    pub(crate) fn update_members(&self) {
        let members: Vec<Rc<TextureInner>> =
            self.state.borrow().members.iter().filter_map(|m| m.texture.upgrade()).collect();
        for texture in &members {
            texture.update_texture_sets();
        }
    }
}

impl Drop for SetInner {
    fn drop(&mut self) {
        let this: *const SetInner = self;
        let members = std::mem::take(&mut self.state.get_mut().members);
        for texture in members.iter().filter_map(|m| m.texture.upgrade()) {
            texture.detach_set(this);
        }
    }
}

/// Shared handle to a group of textures driven by one primary's feedback
#[derive(Clone, Default)]
pub struct FeedbackTextureSet {
    inner: Rc<SetInner>,
}

impl FeedbackTextureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a texture. Returns false if it is already a member.
    pub fn add_texture(&self, texture: &FeedbackTexture) -> bool {
        let ptr = Rc::as_ptr(texture.inner());
        {
            let mut state = self.inner.state.borrow_mut();
            if state.members.iter().any(|m| m.texture.as_ptr() == ptr) {
                return false;
            }
            state.members.push(SetMember {
                texture: Rc::downgrade(texture.inner()),
                id: texture.tiled_texture_id(),
            });
        }
        texture.inner().attach_set(Rc::downgrade(&self.inner));
        self.inner.update_members();
        true
    }

    /// Remove a texture. Returns false if it is not a member.
    pub fn remove_texture(&self, texture: &FeedbackTexture) -> bool {
        if !self.inner.forget_member(Rc::as_ptr(texture.inner())) {
            return false;
        }
        texture.inner().detach_set(Rc::as_ptr(&self.inner));
        self.inner.update_members();
        true
    }

    /// Choose which member captures feedback. Returns false if out of range.
    pub fn set_primary_texture_index(&self, index: usize) -> bool {
        {
            let mut state = self.inner.state.borrow_mut();
            if index >= state.members.len() {
                return false;
            }
            state.primary_index = index;
        }
        self.inner.update_members();
        true
    }

    pub fn primary_texture_index(&self) -> usize {
        self.inner.state.borrow().primary_index
    }

    pub fn num_textures(&self) -> usize {
        self.inner.state.borrow().members.len()
    }

    pub fn texture(&self, index: usize) -> Option<FeedbackTexture> {
        let state = self.inner.state.borrow();
        let inner = state.members.get(index)?.texture.upgrade()?;
        Some(FeedbackTexture::from_inner(inner))
    }

    pub fn primary_texture(&self) -> Option<FeedbackTexture> {
        self.texture(self.primary_texture_index())
    }

    pub fn contains(&self, texture: &FeedbackTexture) -> bool {
        let ptr = Rc::as_ptr(texture.inner());
        self.inner.state.borrow().members.iter().any(|m| m.texture.as_ptr() == ptr)
    }
}

impl std::fmt::Debug for FeedbackTextureSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackTextureSet")
            .field("members", &self.inner.member_ids())
            .field("primary_index", &self.primary_texture_index())
            .finish()
    }
}
