//! Error taxonomy for the emulator, and its mapping onto the platform wire
//! shape `{ok:false, error:"<kind>"}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum. Each non-internal variant carries the wire-level
/// `error` kind verbatim so handlers can build it directly from `?`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("required field is empty: {0}")]
    MissingRequiredField(&'static str),

    #[error("invalid auth")]
    InvalidAuth,

    #[error("invalid config")]
    InvalidConfig,

    #[error("no websocket connection available")]
    NoWebsocketConnection,

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("unknown method")]
    UnknownMethod,

    #[error("message not found")]
    MessageNotFound,

    #[error("view not found")]
    ViewNotFound,

    #[error("user not found")]
    UserNotFound,

    #[error("file not found")]
    FileNotFound,

    #[error("channel already exists")]
    ChannelExists,

    #[error("channel not found")]
    ChannelNotFound,

    #[error("cannot delete a preset channel")]
    CannotDeletePreset,

    #[error("trigger_id expired or unknown")]
    ExpiredTriggerId,

    #[error("no such reaction")]
    NoReaction,

    #[error("invalid JSON body: {0}")]
    InvalidJson(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// The wire-level `error` kind string (see the error taxonomy design note).
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MissingArgument(_) => "missing_argument",
            Error::MissingRequiredField(_) => "missing_required_field",
            Error::InvalidAuth => "invalid_auth",
            Error::InvalidConfig => "invalid_config",
            Error::NoWebsocketConnection => "no_websocket_connection",
            Error::RegistrationFailed(_) => "registration_failed",
            Error::UnknownMethod => "unknown_method",
            Error::MessageNotFound => "message_not_found",
            Error::ViewNotFound => "view_not_found",
            Error::UserNotFound => "user_not_found",
            Error::FileNotFound => "file_not_found",
            Error::ChannelExists => "channel_exists",
            Error::ChannelNotFound => "channel_not_found",
            Error::CannotDeletePreset => "cannot_delete_preset",
            Error::ExpiredTriggerId => "expired_trigger_id",
            Error::NoReaction => "no_reaction",
            Error::InvalidJson(_) => "invalid_json",
            Error::Db(_) | Error::Io(_) | Error::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::NoWebsocketConnection => StatusCode::SERVICE_UNAVAILABLE,
            Error::RegistrationFailed(_) | Error::Db(_) | Error::Io(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::UnknownMethod => StatusCode::NOT_FOUND,
            Error::InvalidJson(_) => StatusCode::BAD_REQUEST,
            Error::MessageNotFound
            | Error::ViewNotFound
            | Error::UserNotFound
            | Error::FileNotFound
            | Error::ChannelNotFound => StatusCode::NOT_FOUND,
            Error::InvalidAuth => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    ok: bool,
    error: &'static str,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if matches!(self, Error::Db(_) | Error::Io(_) | Error::Internal(_)) {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(kind = self.kind(), "request failed");
        }

        let body = ErrorBody {
            ok: false,
            error: self.kind(),
        };
        (self.status(), Json(body)).into_response()
    }
}
