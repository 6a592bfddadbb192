use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::JobState;

/// Lifecycle notifications broadcast by the `JobManager`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum JobEvent {
    Submitted {
        job_id: Uuid,
        name: String,
        timestamp: DateTime<Utc>,
    },
    Started {
        job_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    Finished {
        job_id: Uuid,
        state: JobState,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Submitted { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Finished { job_id, .. } => *job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    #[test]
    fn test_submitted_event_serializes() {
        let event = JobEvent::Submitted {
            job_id: Uuid::nil(),
            name: "predict_seq1".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"event\":\"Submitted\""));
        assert!(json.contains("\"name\":\"predict_seq1\""));
        assert!(json.contains("\"job_id\""));
        assert!(json.contains("\"timestamp\""));
    }

    #[test]
    fn test_finished_event_carries_state() {
        let event = JobEvent::Finished {
            job_id: Uuid::nil(),
            state: JobState::Failed,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["event"], "Finished");
        assert_eq!(value["data"]["state"], "Failed");
    }

    #[test]
    fn test_job_id_accessor() {
        let id = Uuid::now_v7();
        let event = JobEvent::Started {
            job_id: id,
            timestamp: Utc::now(),
        };
        assert_eq!(event.job_id(), id);
    }

    #[tokio::test]
    async fn test_broadcast_two_subscribers_both_receive() {
        let (tx, mut rx1) = broadcast::channel::<JobEvent>(16);
        let mut rx2 = tx.subscribe();

        let id = Uuid::now_v7();
        tx.send(JobEvent::Started {
            job_id: id,
            timestamp: Utc::now(),
        })
        .expect("send");

        assert_eq!(rx1.recv().await.expect("recv1").job_id(), id);
        assert_eq!(rx2.recv().await.expect("recv2").job_id(), id);
    }
}
