use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::crm::CrmService;
use crate::error::SyncError;
use crate::model::{EntityType, Session};

/// Association type linking a meeting to an invited contact.
pub const MEETING_CONTACT_ASSOCIATION: &str = "meeting_event_to_contact";

/// Resolves meeting attendees to contact emails.
pub struct AttendeeEnricher {
    crm: Arc<dyn CrmService>,
}

impl AttendeeEnricher {
    pub fn new(crm: Arc<dyn CrmService>) -> Self {
        Self { crm }
    }

    /// Never fails: lookup errors are logged and yield no attendees.
    #[instrument(skip_all, fields(meeting_id = %meeting_id))]
    pub async fn attendee_emails(&self, session: &Session, meeting_id: &str) -> Vec<String> {
        match self.lookup(session, meeting_id).await {
            Ok(emails) => emails,
            Err(err) => {
                warn!(error = ?err, "attendee enrichment failed");
                Vec::new()
            }
        }
    }

    async fn lookup(&self, session: &Session, meeting_id: &str) -> Result<Vec<String>, SyncError> {
        let fail = |source| SyncError::EnrichmentFailure {
            meeting_id: meeting_id.to_string(),
            source,
        };

        let associations = self
            .crm
            .read_associations(
                session,
                EntityType::Meetings,
                EntityType::Contacts,
                &[meeting_id.to_string()],
            )
            .await
            .map_err(fail)?;

        let contact_ids: Vec<String> = associations
            .into_iter()
            .flat_map(|a| a.to)
            .filter(|to| to.kind == MEETING_CONTACT_ASSOCIATION)
            .map(|to| to.id)
            .collect();
        if contact_ids.is_empty() {
            debug!("no attendees found");
            return Ok(Vec::new());
        }

        let contacts = self
            .crm
            .batch_read(session, EntityType::Contacts, &contact_ids, &["email"])
            .await
            .map_err(fail)?;

        Ok(contacts
            .into_iter()
            .filter_map(|c| {
                c.properties?
                    .get("email")
                    .and_then(|v| v.as_str())
                    .filter(|e| !e.is_empty())
                    .map(str::to_string)
            })
            .collect())
    }
}
