//! The application-level message envelope carried as plaintext inside
//! encrypted transport frames, and the role-admission mapping for each
//! inbound variant.

use serde::{Deserialize, Serialize};

use crate::context::{JobRequest, JobResult};
use crate::crypto::SealedBox;
use crate::orm::bridge::{OrmRequest, OrmResponse};
use crate::peers::MessageKind;

/// One message exchanged over a peer session. Tagged so each side can
/// dispatch on `kind` without guessing from shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireMessage {
    /// Sent by the Consumer to run a job. The sidecar replies with
    /// [`WireMessage::JobReply`] on the same session.
    JobExecute(JobRequest),
    /// The sidecar's reply to a `JobExecute`. Never admitted inbound; a peer
    /// sending one is a protocol violation.
    JobReply { job_id: String, result: JobResult },
    /// Sent by the Admin, once per process unless explicitly re-requested,
    /// carrying the database DSN sealed to this process's X25519 key.
    CredentialsSeal(SealedBox),
    /// Sent by the Admin after applying migrations, declaring the schema
    /// version now in effect.
    MigrationsApply { version: i64 },
    /// A structured database operation, sent by either role subject to
    /// per-op admission.
    OrmRequest(OrmRequest),
    /// The matching reply to an `OrmRequest`, correlated by id. Never
    /// admitted inbound from the role that did not receive the request.
    OrmResponse(OrmResponse),
}

impl WireMessage {
    /// The [`MessageKind`] used for role-admission checks, or `None` for
    /// messages that only ever flow from the sidecar to a peer (replies),
    /// which are not subject to the inbound admission table.
    pub fn message_kind(&self) -> Option<MessageKind> {
        match self {
            WireMessage::JobExecute(_) => Some(MessageKind::JobExecute),
            WireMessage::CredentialsSeal(_) => Some(MessageKind::CredentialsSeal),
            WireMessage::MigrationsApply { .. } => Some(MessageKind::MigrationsApply),
            WireMessage::OrmRequest(request) => Some(request.op.message_kind()),
            WireMessage::JobReply { .. } | WireMessage::OrmResponse(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[test]
    fn job_execute_maps_to_job_execute_kind() {
        let msg = WireMessage::JobExecute(JobRequest {
            job_id: "j1".into(),
            challenge_id: "c1".into(),
            validator_hotkey: "hk".into(),
            session_token: "tok".into(),
            job_name: None,
            payload: serde_json::json!({}),
        });
        assert_eq!(msg.message_kind(), Some(MessageKind::JobExecute));
    }

    #[test]
    fn replies_are_not_subject_to_admission() {
        let reply = WireMessage::JobReply {
            job_id: "j1".into(),
            result: JobResult {
                score: 0.0,
                metrics: BTreeMap::new(),
                job_type: "default".into(),
                logs: None,
                allowed_log_containers: None,
                error: None,
            },
        };
        assert_eq!(reply.message_kind(), None);

        let orm_response = WireMessage::OrmResponse(OrmResponse {
            correlation_id: Uuid::new_v4(),
            result: Ok(vec![]),
        });
        assert_eq!(orm_response.message_kind(), None);
    }

    #[test]
    fn orm_request_kind_follows_inner_op() {
        use crate::orm::bridge::OrmOp;

        let read = WireMessage::OrmRequest(OrmRequest {
            correlation_id: Uuid::new_v4(),
            op: OrmOp::Select {
                table: "jobs".into(),
                columns: vec!["id".into()],
                filters: BTreeMap::new(),
                limit: None,
            },
        });
        assert_eq!(read.message_kind(), Some(MessageKind::OrmRead));

        let write = WireMessage::OrmRequest(OrmRequest {
            correlation_id: Uuid::new_v4(),
            op: OrmOp::Insert {
                table: "jobs".into(),
                values: BTreeMap::new(),
            },
        });
        assert_eq!(write.message_kind(), Some(MessageKind::OrmWrite));
    }

    #[test]
    fn round_trips_through_json() {
        let msg = WireMessage::MigrationsApply { version: 3 };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let decoded: WireMessage = serde_json::from_slice(&bytes).unwrap();
        assert!(matches!(decoded, WireMessage::MigrationsApply { version: 3 }));
    }
}
