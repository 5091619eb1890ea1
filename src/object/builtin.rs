//! Behaviors for the builtin owner-group, persona, role and user types.

use super::{HookContext, ObjectTypeBehavior, ObjectView};
use crate::invid::Invid;
use crate::schema::FieldDef;
use crate::schema::constants::*;

fn is_name_field(obj: &dyn ObjectView, field: &FieldDef) -> bool {
    let name_field = match obj.type_id() {
        OWNER_BASE => OWNER_NAME,
        PERSONA_BASE => PERSONA_NAME,
        ROLE_BASE => ROLE_NAME,
        USER_BASE => USER_NAME,
        _ => return false,
    };
    field.id == name_field
}

fn protected(obj: &dyn ObjectView, invid: Invid) -> bool {
    obj.invid() == invid
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerGroupBehavior;

impl ObjectTypeBehavior for OwnerGroupBehavior {
    fn can_remove(&self, _ctx: &HookContext<'_>, obj: &dyn ObjectView) -> bool {
        !protected(obj, SUPERGASH_OWNER)
    }

    fn field_required(&self, _ctx: &HookContext<'_>, obj: &dyn ObjectView, field: &FieldDef) -> bool {
        is_name_field(obj, field)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PersonaBehavior;

impl ObjectTypeBehavior for PersonaBehavior {
    fn can_remove(&self, _ctx: &HookContext<'_>, obj: &dyn ObjectView) -> bool {
        !protected(obj, ROOT_PERSONA)
    }

    fn field_required(&self, _ctx: &HookContext<'_>, obj: &dyn ObjectView, field: &FieldDef) -> bool {
        is_name_field(obj, field) || field.id == PERSONA_USER
    }

    /// A persona is owned by whoever it is attached to.
    fn grant_ownership(&self, ctx: &HookContext<'_>, obj: &dyn ObjectView) -> bool {
        ctx.persona == Some(obj.invid())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RoleBehavior;

impl ObjectTypeBehavior for RoleBehavior {
    fn can_remove(&self, _ctx: &HookContext<'_>, obj: &dyn ObjectView) -> bool {
        !protected(obj, DEFAULT_ROLE)
    }

    fn field_required(&self, _ctx: &HookContext<'_>, obj: &dyn ObjectView, field: &FieldDef) -> bool {
        is_name_field(obj, field)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UserBehavior;

impl ObjectTypeBehavior for UserBehavior {
    fn can_remove(&self, _ctx: &HookContext<'_>, obj: &dyn ObjectView) -> bool {
        !protected(obj, ROOT_USER)
    }

    fn field_required(&self, _ctx: &HookContext<'_>, obj: &dyn ObjectView, field: &FieldDef) -> bool {
        is_name_field(obj, field)
    }

    /// Personas may be attached to a user by anyone who can edit the persona.
    fn anonymous_link_ok(&self, _ctx: &HookContext<'_>, _target: &dyn ObjectView, field: u16) -> bool {
        field == USER_PERSONAE
    }
}
