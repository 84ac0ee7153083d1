use std::sync::Arc;

use crate::error::IngestError;
use crate::identity::phone_variants;
use crate::store::Store;
use crate::types::{AppState, Contact, GatewayCredentials, NewContact};

/// Who a contact is, as seen on one inbound event.
#[derive(Debug, Clone)]
pub struct ContactHint<'a> {
    pub phone: &'a str,
    pub display_name: Option<&'a str>,
    pub is_group: bool,
    pub from_me: bool,
}

/// Name for a brand new contact. Self-sent messages carry the account owner's
/// push name, so they fall back to the phone.
pub fn initial_name(hint: &ContactHint<'_>) -> String {
    match hint.display_name.map(str::trim) {
        Some(name) if !hint.from_me && !name.is_empty() => name.to_string(),
        _ => hint.phone.to_string(),
    }
}

/// A stored name is only replaced while it is still the phone placeholder.
pub fn should_update_name(stored: &Contact, hint: &ContactHint<'_>) -> Option<String> {
    let name = hint.display_name.map(str::trim).filter(|n| !n.is_empty())?;
    let placeholder = stored.name == stored.phone_number || stored.name == hint.phone;
    if hint.from_me || name == hint.phone || !placeholder {
        return None;
    }
    Some(name.to_string())
}

/// Finds the contact for `hint.phone` (or a legacy variant of it), creating it
/// when absent. Returns the contact id.
pub async fn resolve(
    state: &AppState,
    creds: &GatewayCredentials,
    instance_id: &str,
    hint: &ContactHint<'_>,
) -> Result<String, IngestError> {
    let variants = phone_variants(hint.phone);

    if let Some(existing) = state
        .store
        .find_contact_by_phones(instance_id, &variants)
        .await?
    {
        refresh_existing(state.store.as_ref(), &existing, hint).await?;
        return Ok(existing.id);
    }

    let new_contact = NewContact {
        instance_id: instance_id.to_string(),
        phone_number: hint.phone.to_string(),
        name: initial_name(hint),
        is_group: hint.is_group,
    };
    match state.store.insert_contact(&new_contact).await? {
        Some(created) => {
            tracing::info!(contact_id = %created.id, phone = %created.phone_number, "contact created");
            spawn_profile_fetch(state, creds.clone(), created.id.clone(), created.phone_number);
            Ok(created.id)
        }
        None => {
            // Lost the insert race to a concurrent delivery.
            let winner = state
                .store
                .find_contact_by_phones(instance_id, &variants)
                .await?
                .ok_or_else(|| IngestError::NotFound("contact", hint.phone.to_string()))?;
            Ok(winner.id)
        }
    }
}

async fn refresh_existing(
    store: &dyn Store,
    existing: &Contact,
    hint: &ContactHint<'_>,
) -> Result<(), IngestError> {
    if existing.phone_number != hint.phone {
        match store.update_contact_phone(&existing.id, hint.phone).await {
            Ok(()) => tracing::info!(
                contact_id = %existing.id,
                from = %existing.phone_number,
                to = %hint.phone,
                "contact phone normalized"
            ),
            Err(err) => tracing::warn!(
                contact_id = %existing.id,
                error = %err,
                "could not normalize contact phone"
            ),
        }
    }

    if let Some(name) = should_update_name(existing, hint) {
        store.update_contact_name(&existing.id, &name).await?;
        tracing::info!(contact_id = %existing.id, "contact name updated");
    }
    Ok(())
}

fn spawn_profile_fetch(state: &AppState, creds: GatewayCredentials, contact_id: String, phone: String) {
    let store: Arc<dyn Store> = state.store.clone();
    let gateway = state.gateway.clone();
    state.background.spawn("profile_picture", async move {
        if let Some(url) = gateway.fetch_profile_picture(&creds, &phone).await? {
            store.update_contact_picture(&contact_id, &url).await?;
            tracing::debug!(contact_id = %contact_id, "profile picture stored");
        }
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_state, CREDS_INSTANCE};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn hint<'a>(phone: &'a str, name: Option<&'a str>, from_me: bool) -> ContactHint<'a> {
        ContactHint {
            phone,
            display_name: name,
            is_group: false,
            from_me,
        }
    }

    fn contact(name: &str, phone: &str) -> Contact {
        Contact {
            id: "c1".into(),
            instance_id: "i1".into(),
            phone_number: phone.into(),
            name: name.into(),
            is_group: false,
            profile_picture_url: None,
            notes: None,
        }
    }

    #[test]
    fn self_sent_messages_never_name_contacts() {
        let phone = "5548999990000";
        assert_eq!(initial_name(&hint(phone, Some("Owner"), true)), phone);
        assert_eq!(initial_name(&hint(phone, Some("Maria"), false)), "Maria");
        assert_eq!(initial_name(&hint(phone, None, false)), phone);
        assert_eq!(
            should_update_name(&contact(phone, phone), &hint(phone, Some("Owner"), true)),
            None
        );
    }

    #[test]
    fn name_updates_only_replace_placeholders() {
        let phone = "5548999990000";
        assert_eq!(
            should_update_name(&contact(phone, phone), &hint(phone, Some("Maria"), false)),
            Some("Maria".into())
        );
        assert_eq!(
            should_update_name(&contact("Maria", phone), &hint(phone, Some("Other"), false)),
            None
        );
        assert_eq!(
            should_update_name(&contact(phone, phone), &hint(phone, Some(phone), false)),
            None
        );
    }

    #[tokio::test]
    async fn legacy_phone_is_migrated_to_canonical() {
        let (state, store, creds, _media) = test_state("http://127.0.0.1:9").await;
        store.add_contact(contact("554899990000", "554899990000"));

        let id = resolve(&state, &creds, "i1", &hint("5548999990000", Some("Maria"), false))
            .await
            .unwrap();
        assert_eq!(id, "c1");
        let stored = &store.contacts()[0];
        assert_eq!(stored.phone_number, "5548999990000");
        assert_eq!(stored.name, "Maria");
        assert_eq!(store.contacts().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_resolution_creates_one_contact() {
        let (state, store, creds, _media) = test_state("http://127.0.0.1:9").await;
        let state = Arc::new(state);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            let creds = creds.clone();
            handles.push(tokio::spawn(async move {
                resolve(&state, &creds, "i1", &hint("5548999990000", Some("Maria"), false)).await
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.contacts().len(), 1);
    }

    #[tokio::test]
    async fn new_contacts_get_a_profile_picture_in_the_background() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/chat/fetchProfile/{CREDS_INSTANCE}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "profilePictureUrl": "https://cdn.example/a.jpg" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (state, store, creds, _media) = test_state(&server.uri()).await;
        resolve(&state, &creds, "i1", &hint("14155550100", None, false))
            .await
            .unwrap();
        state.background.wait_idle().await;

        let stored = &store.contacts()[0];
        assert_eq!(stored.name, "14155550100");
        assert_eq!(
            stored.profile_picture_url.as_deref(),
            Some("https://cdn.example/a.jpg")
        );
    }

    #[tokio::test]
    async fn profile_fetch_failure_does_not_block_creation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (state, store, creds, _media) = test_state(&server.uri()).await;
        resolve(&state, &creds, "i1", &hint("14155550100", Some("Ana"), false))
            .await
            .unwrap();
        state.background.wait_idle().await;
        assert_eq!(store.contacts()[0].name, "Ana");
        assert!(store.contacts()[0].profile_picture_url.is_none());
    }
}
