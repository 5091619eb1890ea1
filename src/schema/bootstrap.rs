//! The builtin types and the objects every fresh store starts with.

use super::constants::*;
use super::{FieldDef, FieldKind, ObjectTypeDef, Schema};
use crate::error::DbResult;
use crate::field::{DbField, FieldValue, SecretHash, Value};
use crate::invid::Invid;
use crate::object::DbObject;
use crate::object::builtin::{OwnerGroupBehavior, PersonaBehavior, RoleBehavior, UserBehavior};
use crate::perm::PermMatrix;
use std::sync::Arc;

pub fn builtin_schema(case_insensitive: bool) -> DbResult<Schema> {
    let mut schema = Schema::default();
    for ns in [
        OWNER_NAMESPACE,
        PERSONA_NAMESPACE,
        ROLE_NAMESPACE,
        USER_NAMESPACE,
    ] {
        schema.declare_namespace(ns, case_insensitive);
    }

    schema.register(
        ObjectTypeDef::new(OWNER_BASE, "owner group")
            .with_field(FieldDef::text(OWNER_NAME, "name").namespace(OWNER_NAMESPACE))
            .with_field(
                FieldDef::invid(OWNER_MEMBERS, "members")
                    .vector()
                    .symmetric(PERSONA_BASE, PERSONA_GROUPS),
            )
            .with_label(OWNER_NAME)
            .with_behavior(Arc::new(OwnerGroupBehavior)),
    )?;

    schema.register(
        ObjectTypeDef::new(PERSONA_BASE, "admin persona")
            .with_field(FieldDef::text(PERSONA_NAME, "name").namespace(PERSONA_NAMESPACE))
            .with_field(FieldDef::new(PERSONA_SECRET, "password", FieldKind::Secret))
            .with_field(
                FieldDef::invid(PERSONA_GROUPS, "owner groups")
                    .vector()
                    .symmetric(OWNER_BASE, OWNER_MEMBERS),
            )
            .with_field(FieldDef::invid(PERSONA_USER, "user").symmetric(USER_BASE, USER_PERSONAE))
            .with_field(
                FieldDef::invid(PERSONA_PRIVS, "roles")
                    .vector()
                    .symmetric(ROLE_BASE, ROLE_PERSONAE),
            )
            .with_label(PERSONA_NAME)
            .with_behavior(Arc::new(PersonaBehavior)),
    )?;

    schema.register(
        ObjectTypeDef::new(ROLE_BASE, "role")
            .with_field(FieldDef::text(ROLE_NAME, "name").namespace(ROLE_NAMESPACE))
            .with_field(FieldDef::new(ROLE_MATRIX, "owned object bits", FieldKind::PermMatrix))
            .with_field(FieldDef::new(
                ROLE_DEFAULT_MATRIX,
                "default bits",
                FieldKind::PermMatrix,
            ))
            .with_field(FieldDef::new(ROLE_DELEGATABLE, "delegatable", FieldKind::Bool))
            .with_field(
                FieldDef::invid(ROLE_PERSONAE, "personae")
                    .vector()
                    .symmetric(PERSONA_BASE, PERSONA_PRIVS),
            )
            .with_label(ROLE_NAME)
            .with_behavior(Arc::new(RoleBehavior)),
    )?;

    schema.register(
        ObjectTypeDef::new(USER_BASE, "user")
            .with_field(FieldDef::text(USER_NAME, "username").namespace(USER_NAMESPACE))
            .with_field(FieldDef::new(USER_SECRET, "password", FieldKind::Secret))
            .with_field(
                FieldDef::invid(USER_PERSONAE, "personae")
                    .vector()
                    .symmetric(PERSONA_BASE, PERSONA_USER),
            )
            .with_label(USER_NAME)
            .with_behavior(Arc::new(UserBehavior)),
    )?;

    Ok(schema)
}

fn text(id: u16, s: &str) -> DbField {
    DbField::with_value(id, FieldValue::Scalar(Some(Value::from(s))))
}

fn refs(id: u16, invids: &[Invid]) -> DbField {
    DbField::with_value(
        id,
        FieldValue::Vector(invids.iter().copied().map(Value::Invid).collect()),
    )
}

/// Supergash owner group, root persona, default role and root user.
pub fn bootstrap_objects(root_secret: &str, now_ms: i64) -> Vec<DbObject> {
    let stamp = |mut fields: Vec<DbField>| {
        fields.push(DbField::with_value(
            CREATION_DATE_FIELD,
            FieldValue::Scalar(Some(Value::Date(now_ms))),
        ));
        fields.push(text(CREATOR_FIELD, ROOT_USERNAME));
        fields
    };

    vec![
        DbObject::from_fields(
            SUPERGASH_OWNER,
            stamp(vec![
                text(OWNER_NAME, SUPERGASH_PERSONA_NAME),
                refs(OWNER_MEMBERS, &[ROOT_PERSONA]),
            ]),
        ),
        DbObject::from_fields(
            ROOT_PERSONA,
            stamp(vec![
                refs(OWNER_LIST_FIELD, &[SUPERGASH_OWNER]),
                text(PERSONA_NAME, SUPERGASH_PERSONA_NAME),
                DbField::with_value(
                    PERSONA_SECRET,
                    FieldValue::Secret(Some(SecretHash::new(root_secret))),
                ),
                refs(PERSONA_GROUPS, &[SUPERGASH_OWNER]),
                DbField::with_value(
                    PERSONA_USER,
                    FieldValue::Scalar(Some(Value::Invid(ROOT_USER))),
                ),
            ]),
        ),
        DbObject::from_fields(
            DEFAULT_ROLE,
            stamp(vec![
                refs(OWNER_LIST_FIELD, &[SUPERGASH_OWNER]),
                text(ROLE_NAME, "default"),
                DbField::with_value(ROLE_MATRIX, FieldValue::Matrix(PermMatrix::new())),
                DbField::with_value(ROLE_DEFAULT_MATRIX, FieldValue::Matrix(PermMatrix::new())),
            ]),
        ),
        DbObject::from_fields(
            ROOT_USER,
            stamp(vec![
                refs(OWNER_LIST_FIELD, &[SUPERGASH_OWNER]),
                text(USER_NAME, ROOT_USERNAME),
                DbField::with_value(
                    USER_SECRET,
                    FieldValue::Secret(Some(SecretHash::new(root_secret))),
                ),
                refs(USER_PERSONAE, &[ROOT_PERSONA]),
            ]),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::{bootstrap_objects, builtin_schema};
    use crate::object::ObjectView;
    use crate::schema::constants::*;

    #[test]
    fn builtin_types_link_symmetrically() {
        let schema = builtin_schema(true).expect("schema");
        let members = schema.field(OWNER_BASE, OWNER_MEMBERS).expect("members");
        assert_eq!(members.symmetric_link(), Some((PERSONA_BASE, PERSONA_GROUPS)));
        let groups = schema.field(PERSONA_BASE, PERSONA_GROUPS).expect("groups");
        assert_eq!(groups.symmetric_link(), Some((OWNER_BASE, OWNER_MEMBERS)));
        assert!(schema.namespaces().all(|(_, ci)| ci));
    }

    #[test]
    fn bootstrap_objects_reference_each_other() {
        let objects = bootstrap_objects("pw", 0);
        let persona = objects
            .iter()
            .find(|o| o.invid() == ROOT_PERSONA)
            .expect("persona");
        assert_eq!(persona.invids(PERSONA_GROUPS), vec![SUPERGASH_OWNER]);
        assert!(persona
            .field_value(PERSONA_SECRET)
            .and_then(|v| v.as_secret())
            .expect("secret")
            .verify("pw"));
        let user = objects.iter().find(|o| o.invid() == ROOT_USER).expect("user");
        assert_eq!(user.invids(USER_PERSONAE), vec![ROOT_PERSONA]);
    }
}
