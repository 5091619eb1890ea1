//! Reserved type ids, builtin field ids and bootstrap object numbers.

use crate::invid::Invid;

pub const OWNER_BASE: u16 = 0;
pub const PERSONA_BASE: u16 = 1;
pub const ROLE_BASE: u16 = 2;
pub const USER_BASE: u16 = 3;
/// First type id available to applications.
pub const FIRST_USER_TYPE: u16 = 256;

/// Owner groups on ordinary objects; the container reference on embedded ones.
pub const OWNER_LIST_FIELD: u16 = 0;
pub const CONTAINER_FIELD: u16 = 0;
pub const REMOVAL_FIELD: u16 = 1;
pub const NOTES_FIELD: u16 = 2;
pub const CREATION_DATE_FIELD: u16 = 3;
pub const CREATOR_FIELD: u16 = 4;
pub const MODIFICATION_DATE_FIELD: u16 = 5;
pub const MODIFIER_FIELD: u16 = 6;
pub const FINAL_SYSTEM_FIELD: u16 = 6;
/// First field id available to type definitions.
pub const FIRST_USER_FIELD: u16 = 100;

pub const OWNER_NAME: u16 = 100;
pub const OWNER_MEMBERS: u16 = 101;

pub const PERSONA_NAME: u16 = 100;
pub const PERSONA_SECRET: u16 = 101;
pub const PERSONA_GROUPS: u16 = 102;
pub const PERSONA_USER: u16 = 103;
pub const PERSONA_PRIVS: u16 = 104;

pub const ROLE_NAME: u16 = 100;
pub const ROLE_MATRIX: u16 = 101;
pub const ROLE_DEFAULT_MATRIX: u16 = 102;
pub const ROLE_DELEGATABLE: u16 = 103;
pub const ROLE_PERSONAE: u16 = 104;

pub const USER_NAME: u16 = 100;
pub const USER_SECRET: u16 = 101;
pub const USER_PERSONAE: u16 = 102;

pub const OWNER_NAMESPACE: &str = "ownerbase";
pub const PERSONA_NAMESPACE: &str = "persona";
pub const ROLE_NAMESPACE: &str = "rolespace";
pub const USER_NAMESPACE: &str = "username";

pub const SUPERGASH_OWNER: Invid = Invid::new(OWNER_BASE, 1);
pub const ROOT_PERSONA: Invid = Invid::new(PERSONA_BASE, 1);
pub const DEFAULT_ROLE: Invid = Invid::new(ROLE_BASE, 1);
pub const ROOT_USER: Invid = Invid::new(USER_BASE, 1);

pub const ROOT_USERNAME: &str = "root";
pub const SUPERGASH_PERSONA_NAME: &str = "supergash";

/// True for the history fields stamped at commit.
pub const fn is_history_field(field: u16) -> bool {
    matches!(
        field,
        CREATION_DATE_FIELD | CREATOR_FIELD | MODIFICATION_DATE_FIELD | MODIFIER_FIELD
    )
}
