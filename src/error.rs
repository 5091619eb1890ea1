use crate::invid::Invid;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    ObjectType,
    Field,
    Object,
    Namespace,
    Session,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::ObjectType => write!(f, "object type"),
            ResourceType::Field => write!(f, "field"),
            ResourceType::Object => write!(f, "object"),
            ResourceType::Namespace => write!(f, "namespace"),
            ResourceType::Session => write!(f, "session"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorCode {
    Io,
    Encode,
    Decode,
    InvalidConfig,
    NotLoggedIn,
    Authentication,
    PermissionDenied,
    ObjectTypeNotFound,
    FieldNotFound,
    ObjectNotFound,
    NamespaceNotFound,
    SessionNotFound,
    ScalarOnVector,
    VectorOnScalar,
    NotInEditContext,
    BadCheckpointToken,
    UnknownCheckpoint,
    UnknownStatus,
    NamespaceInvariant,
    ShadowInvariant,
    InvalidArgument,
}

impl DbErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DbErrorCode::Io => "io",
            DbErrorCode::Encode => "encode",
            DbErrorCode::Decode => "decode",
            DbErrorCode::InvalidConfig => "invalid_config",
            DbErrorCode::NotLoggedIn => "not_logged_in",
            DbErrorCode::Authentication => "authentication",
            DbErrorCode::PermissionDenied => "permission_denied",
            DbErrorCode::ObjectTypeNotFound => "object_type_not_found",
            DbErrorCode::FieldNotFound => "field_not_found",
            DbErrorCode::ObjectNotFound => "object_not_found",
            DbErrorCode::NamespaceNotFound => "namespace_not_found",
            DbErrorCode::SessionNotFound => "session_not_found",
            DbErrorCode::ScalarOnVector => "scalar_on_vector",
            DbErrorCode::VectorOnScalar => "vector_on_scalar",
            DbErrorCode::NotInEditContext => "not_in_edit_context",
            DbErrorCode::BadCheckpointToken => "bad_checkpoint_token",
            DbErrorCode::UnknownCheckpoint => "unknown_checkpoint",
            DbErrorCode::UnknownStatus => "unknown_status",
            DbErrorCode::NamespaceInvariant => "namespace_invariant",
            DbErrorCode::ShadowInvariant => "shadow_invariant",
            DbErrorCode::InvalidArgument => "invalid_argument",
        }
    }
}

/// Engine errors.
///
/// Business conditions raised by field and transaction mutations travel as
/// [`crate::returnval::ReturnVal`] values instead. The variants here are
/// either session-level failures (not logged in, read denied) or defects:
/// conditions only reachable through a caller bug. [`DbError::is_defect`]
/// separates the two.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("session is not logged in")]
    NotLoggedIn,
    #[error("authentication failed for '{0}'")]
    Authentication(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("scalar operation called on vector field {field} in {invid}")]
    ScalarOnVector { invid: Invid, field: u16 },
    #[error("vector operation called on scalar field {field} in {invid}")]
    VectorOnScalar { invid: Invid, field: u16 },
    #[error("object {0} is not an edit shadow in this transaction")]
    NotInEditContext(Invid),
    #[error("checkpoint token does not match field {field} in {invid}")]
    BadCheckpointToken { invid: Invid, field: u16 },
    #[error("no checkpoint named '{0}' on the checkpoint stack")]
    UnknownCheckpoint(String),
    #[error("unrecognized object status code {0}")]
    UnknownStatus(u8),
    #[error("namespace '{namespace}' invariant violated: {message}")]
    NamespaceInvariant { namespace: String, message: String },
    #[error("shadow bookkeeping violated for {invid}: {message}")]
    ShadowInvariant { invid: Invid, message: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    pub fn code(&self) -> DbErrorCode {
        match self {
            DbError::Io(_) => DbErrorCode::Io,
            DbError::Encode(_) => DbErrorCode::Encode,
            DbError::Decode(_) => DbErrorCode::Decode,
            DbError::InvalidConfig { .. } => DbErrorCode::InvalidConfig,
            DbError::NotLoggedIn => DbErrorCode::NotLoggedIn,
            DbError::Authentication(_) => DbErrorCode::Authentication,
            DbError::PermissionDenied(_) => DbErrorCode::PermissionDenied,
            DbError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::ObjectType => DbErrorCode::ObjectTypeNotFound,
                ResourceType::Field => DbErrorCode::FieldNotFound,
                ResourceType::Object => DbErrorCode::ObjectNotFound,
                ResourceType::Namespace => DbErrorCode::NamespaceNotFound,
                ResourceType::Session => DbErrorCode::SessionNotFound,
            },
            DbError::ScalarOnVector { .. } => DbErrorCode::ScalarOnVector,
            DbError::VectorOnScalar { .. } => DbErrorCode::VectorOnScalar,
            DbError::NotInEditContext(_) => DbErrorCode::NotInEditContext,
            DbError::BadCheckpointToken { .. } => DbErrorCode::BadCheckpointToken,
            DbError::UnknownCheckpoint(_) => DbErrorCode::UnknownCheckpoint,
            DbError::UnknownStatus(_) => DbErrorCode::UnknownStatus,
            DbError::NamespaceInvariant { .. } => DbErrorCode::NamespaceInvariant,
            DbError::ShadowInvariant { .. } => DbErrorCode::ShadowInvariant,
            DbError::InvalidArgument(_) => DbErrorCode::InvalidArgument,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// True for conditions that indicate a caller bug rather than a data or
    /// permission problem.
    pub fn is_defect(&self) -> bool {
        !matches!(
            self,
            DbError::Io(_)
                | DbError::InvalidConfig { .. }
                | DbError::NotLoggedIn
                | DbError::Authentication(_)
                | DbError::PermissionDenied(_)
                | DbError::NotFound {
                    resource_type: ResourceType::Object | ResourceType::Session,
                    ..
                }
        )
    }

    pub(crate) fn object_not_found(invid: Invid) -> Self {
        DbError::NotFound {
            resource_type: ResourceType::Object,
            resource_id: invid.to_string(),
        }
    }

    pub(crate) fn type_not_found(type_id: u16) -> Self {
        DbError::NotFound {
            resource_type: ResourceType::ObjectType,
            resource_id: type_id.to_string(),
        }
    }

    pub(crate) fn field_not_found(type_id: u16, field_id: u16) -> Self {
        DbError::NotFound {
            resource_type: ResourceType::Field,
            resource_id: format!("{type_id}:{field_id}"),
        }
    }
}
