//! Typed views over the argument lists of individual commands.
//!
//! On the wire a [`Command`] carries an opaque `Vec<CommandArg>`; these
//! helpers pin down the layout each code uses so both ends build and read
//! them the same way.

use std::fmt;

use crate::constants::PROTOCOL_VERSION;
use crate::error::ProtocolError;
use crate::protocol::{Command, CommandArg, CommandCode, EntityHeader, ReasonCode, TransferManifest};
use crate::types::{InstanceId, UserId, UserSummary};

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Guest,
    Login {
        username: String,
        password: String,
    },
    SignUp {
        email: String,
        username: String,
        password: String,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guest => f.write_str("Guest"),
            Self::Login { username, .. } => f
                .debug_struct("Login")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::SignUp { email, username, .. } => f
                .debug_struct("SignUp")
                .field("email", email)
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// `CONNECTION_REQUEST`: `[Text(version), Bool(guest), Bool(new_account),
/// Text(username), Text(password), Text(email)]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub version: String,
    pub credentials: Credentials,
}

impl ConnectionRequest {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            credentials,
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }

    pub fn into_command(self) -> Command {
        let (guest, new_account, username, password, email) = match self.credentials {
            Credentials::Guest => (true, false, String::new(), String::new(), String::new()),
            Credentials::Login { username, password } => {
                (false, false, username, password, String::new())
            }
            Credentials::SignUp {
                email,
                username,
                password,
            } => (false, true, username, password, email),
        };

        Command::new(
            EntityHeader::new(username.clone(), UserId::UNASSIGNED),
            CommandCode::ConnectionRequest,
        )
        .with_arg(CommandArg::Text(self.version))
        .with_arg(CommandArg::Bool(guest))
        .with_arg(CommandArg::Bool(new_account))
        .with_arg(CommandArg::Text(username))
        .with_arg(CommandArg::Text(password))
        .with_arg(CommandArg::Text(email))
    }

    pub fn from_command(cmd: &Command) -> Result<Self, ProtocolError> {
        let version = cmd.text(0)?.to_string();
        let credentials = if cmd.flag(1)? {
            Credentials::Guest
        } else if cmd.flag(2)? {
            Credentials::SignUp {
                username: cmd.text(3)?.to_string(),
                password: cmd.text(4)?.to_string(),
                email: cmd.text(5)?.to_string(),
            }
        } else {
            Credentials::Login {
                username: cmd.text(3)?.to_string(),
                password: cmd.text(4)?.to_string(),
            }
        };
        Ok(Self {
            version,
            credentials,
        })
    }
}

/// `CONNECTION_AUTHORIZED`: `[Text(username), Text(user_id), Int(instance_id)]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionGrant {
    pub username: String,
    pub user_id: UserId,
    pub instance_id: InstanceId,
}

impl ConnectionGrant {
    pub fn into_command(self) -> Command {
        Command::new(EntityHeader::server(), CommandCode::ConnectionAuthorized)
            .with_arg(CommandArg::Text(self.username))
            .with_arg(CommandArg::Text(self.user_id.to_hex()))
            .with_arg(CommandArg::Int(self.instance_id.0))
    }

    pub fn from_command(cmd: &Command) -> Result<Self, ProtocolError> {
        let user_id = UserId::from_hex(cmd.text(1)?).map_err(|_| ProtocolError::BadArgument {
            code: cmd.code.name(),
            index: 1,
        })?;
        Ok(Self {
            username: cmd.text(0)?.to_string(),
            user_id,
            instance_id: InstanceId(cmd.int(2)?),
        })
    }
}

/// The other party named in a relayed private-chatroom command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRef {
    pub instance_id: InstanceId,
    pub username: String,
}

impl PeerRef {
    /// Server → client layout: `[Int(instance_id), Text(username)]`.
    pub fn from_command(cmd: &Command) -> Result<Self, ProtocolError> {
        Ok(Self {
            instance_id: InstanceId(cmd.int(0)?),
            username: cmd.text(1)?.to_string(),
        })
    }

    pub fn relay(&self, code: CommandCode) -> Command {
        Command::new(EntityHeader::server(), code)
            .with_arg(CommandArg::Int(self.instance_id.0))
            .with_arg(CommandArg::Text(self.username.clone()))
    }
}

/// Client → server private-chatroom command naming its target by instance.
pub fn private_chatroom(header: EntityHeader, code: CommandCode, target: InstanceId) -> Command {
    Command::new(header, code).with_arg(CommandArg::Int(target.0))
}

pub fn connection_denied(reason: ReasonCode) -> Command {
    Command::new(EntityHeader::server(), CommandCode::ConnectionDenied).with_reason(reason)
}

pub fn connection_suspended(reason: ReasonCode) -> Command {
    Command::new(EntityHeader::server(), CommandCode::ConnectionSuspended).with_reason(reason)
}

pub fn connected_users(users: Vec<UserSummary>) -> Command {
    Command::new(EntityHeader::server(), CommandCode::ConnectedUsers)
        .with_arg(CommandArg::Users(users))
}

pub fn file_transfer(header: EntityHeader, manifest: TransferManifest) -> Command {
    Command::new(header, CommandCode::FileTransfer).with_arg(CommandArg::Manifest(manifest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_request_roundtrip() {
        let cmd = ConnectionRequest::new(Credentials::Guest).into_command();
        assert_eq!(cmd.code, CommandCode::ConnectionRequest);
        assert!(!cmd.header.sender_id.is_assigned());

        let parsed = ConnectionRequest::from_command(&cmd).unwrap();
        assert_eq!(parsed.credentials, Credentials::Guest);
        assert!(parsed.is_compatible());
    }

    #[test]
    fn test_sign_up_request_roundtrip() {
        let creds = Credentials::SignUp {
            email: "a@example.org".into(),
            username: "alice".into(),
            password: "hunter2".into(),
        };
        let cmd = ConnectionRequest::new(creds.clone()).into_command();
        assert_eq!(ConnectionRequest::from_command(&cmd).unwrap().credentials, creds);
    }

    #[test]
    fn test_old_version_is_incompatible() {
        let mut req = ConnectionRequest::new(Credentials::Guest);
        req.version = "parley/0.9".into();
        let parsed = ConnectionRequest::from_command(&req.into_command()).unwrap();
        assert!(!parsed.is_compatible());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::Login {
            username: "alice".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[test]
    fn test_grant_roundtrip() {
        let grant = ConnectionGrant {
            username: "GuestABCDEFGHIJKLMNOP".into(),
            user_id: UserId::generate(),
            instance_id: InstanceId(9),
        };
        let cmd = grant.clone().into_command();
        assert_eq!(ConnectionGrant::from_command(&cmd).unwrap(), grant);
    }

    #[test]
    fn test_truncated_request_is_bad_argument() {
        let cmd = Command::new(EntityHeader::server(), CommandCode::ConnectionRequest)
            .with_arg(CommandArg::Text(PROTOCOL_VERSION.into()));
        assert!(matches!(
            ConnectionRequest::from_command(&cmd),
            Err(ProtocolError::BadArgument { index: 1, .. })
        ));
    }
}
