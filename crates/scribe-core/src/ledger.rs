//! Save destinations, the per-(user, task) saved set, and the save keyboard.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    domain::{TaskId, UserId},
    messaging::{InlineButton, InlineKeyboard},
    store::{keys, KeyValueStore},
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Flomo,
    Notion,
}

impl Destination {
    pub const ALL: [Destination; 2] = [Destination::Flomo, Destination::Notion];

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Flomo => "flomo",
            Destination::Notion => "notion",
        }
    }

    /// Short tag stored in the saved set.
    pub fn tag(&self) -> &'static str {
        match self {
            Destination::Flomo => "f",
            Destination::Notion => "n",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.tag() == tag)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Destination::Flomo => "Flomo",
            Destination::Notion => "Notion",
        }
    }

    fn icon(&self) -> &'static str {
        match self {
            Destination::Flomo => "📝",
            Destination::Notion => "📘",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "flomo" => Ok(Destination::Flomo),
            "notion" => Ok(Destination::Notion),
            other => Err(Error::InvalidCallback(format!("unknown destination: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveVerb {
    Save,
    Noop,
}

/// Callback data carried by the save buttons: `{"a":"save","t":"<task>","to":"flomo"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveAction {
    #[serde(rename = "a")]
    pub verb: SaveVerb,
    #[serde(rename = "t")]
    pub task_id: TaskId,
    pub to: Destination,
}

impl SaveAction {
    pub fn parse(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| Error::InvalidCallback(e.to_string()))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Buttons for one delivered result. Destinations already saved render as a
/// disabled-looking "✅ Saved" button whose payload is a noop.
pub fn save_keyboard(task_id: &TaskId, saved: &[Destination]) -> Result<InlineKeyboard> {
    let mut row = Vec::with_capacity(Destination::ALL.len());
    for to in Destination::ALL {
        let done = saved.contains(&to);
        let action = SaveAction {
            verb: if done { SaveVerb::Noop } else { SaveVerb::Save },
            task_id: task_id.clone(),
            to,
        };
        let label = if done {
            format!("✅ Saved to {}", to.label())
        } else {
            format!("{} Save to {}", to.icon(), to.label())
        };
        row.push(InlineButton {
            label,
            callback_data: action.encode()?,
        });
    }
    Ok(InlineKeyboard::new(vec![row]))
}

/// Which destinations a user already saved a task to.
pub struct SaveLedger {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl SaveLedger {
    /// `ttl` matches the cached result retention; it only applies when the
    /// cached result carries no expiry of its own.
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn saved(&self, user_id: UserId, task_id: &TaskId) -> Result<Vec<Destination>> {
        let tags = self.store.smembers(&keys::saved(user_id, task_id)).await?;
        let mut out: Vec<Destination> = tags.iter().filter_map(|t| Destination::from_tag(t)).collect();
        out.sort_by_key(|d| d.tag());
        Ok(out)
    }

    pub async fn is_saved(&self, user_id: UserId, task_id: &TaskId, to: Destination) -> Result<bool> {
        Ok(self.saved(user_id, task_id).await?.contains(&to))
    }

    /// Mark `to` as saved. The marker expires together with the cached result.
    pub async fn record(&self, user_id: UserId, task_id: &TaskId, to: Destination) -> Result<()> {
        let key = keys::saved(user_id, task_id);
        let ttl = self
            .store
            .ttl(&keys::result(task_id))
            .await?
            .unwrap_or(self.ttl);
        self.store.sadd(&key, to.tag()).await?;
        self.store.expire(&key, ttl).await?;
        Ok(())
    }

    /// Claim the in-flight slot for one save. False when another click holds it.
    pub async fn begin(
        &self,
        user_id: UserId,
        task_id: &TaskId,
        to: Destination,
        hold: Duration,
    ) -> Result<bool> {
        self.store
            .set_nx(&keys::saving(user_id, task_id, to.tag()), "1", Some(hold))
            .await
    }

    pub async fn finish(&self, user_id: UserId, task_id: &TaskId, to: Destination) -> Result<()> {
        self.store
            .del(&keys::saving(user_id, task_id, to.tag()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn action_wire_format() {
        let a = SaveAction::parse(r#"{"a":"save","t":"1700000000000-abc123","to":"notion"}"#)
            .unwrap();
        assert_eq!(a.verb, SaveVerb::Save);
        assert_eq!(a.to, Destination::Notion);
        assert_eq!(a.task_id.as_str(), "1700000000000-abc123");
        assert_eq!(
            a.encode().unwrap(),
            r#"{"a":"save","t":"1700000000000-abc123","to":"notion"}"#
        );
    }

    #[test]
    fn malformed_actions_are_rejected() {
        for bad in [
            "not json",
            r#"{"a":"delete","t":"x","to":"flomo"}"#,
            r#"{"a":"save","t":"x","to":"dropbox"}"#,
            r#"{"a":"save","to":"flomo"}"#,
        ] {
            assert!(matches!(SaveAction::parse(bad), Err(Error::InvalidCallback(_))), "{bad}");
        }
    }

    #[test]
    fn keyboard_fits_callback_limit_and_marks_saved() {
        let task = TaskId::from("1700000000000-abc123");
        let kb = save_keyboard(&task, &[Destination::Flomo]).unwrap();
        let buttons: Vec<_> = kb.buttons().collect();
        assert_eq!(buttons.len(), 2);
        assert_eq!(buttons[0].label, "✅ Saved to Flomo");
        assert_eq!(
            SaveAction::parse(&buttons[0].callback_data).unwrap().verb,
            SaveVerb::Noop
        );
        assert_eq!(buttons[1].label, "📘 Save to Notion");
        for b in buttons {
            assert!(b.callback_data.len() <= 64, "{}", b.callback_data);
        }
    }

    #[tokio::test]
    async fn ledger_tracks_destinations_independently() {
        let ledger = SaveLedger::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        let task = TaskId::from("t1");
        ledger.record(UserId(1), &task, Destination::Flomo).await.unwrap();
        assert!(ledger.is_saved(UserId(1), &task, Destination::Flomo).await.unwrap());
        assert!(!ledger.is_saved(UserId(1), &task, Destination::Notion).await.unwrap());
        assert!(!ledger.is_saved(UserId(2), &task, Destination::Flomo).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn saved_marker_expires_with_the_result() {
        let store = Arc::new(MemoryStore::new());
        let ledger = SaveLedger::new(store.clone(), Duration::from_secs(3600));
        let task = TaskId::from("t1");
        store
            .set(&keys::result(&task), "body", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        ledger.record(UserId(1), &task, Destination::Flomo).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(ledger.is_saved(UserId(1), &task, Destination::Flomo).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get(&keys::result(&task)).await.unwrap().is_none());
        assert!(!ledger.is_saved(UserId(1), &task, Destination::Flomo).await.unwrap());
    }

    #[tokio::test]
    async fn in_flight_claim_is_exclusive() {
        let ledger = SaveLedger::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        let task = TaskId::from("t1");
        let hold = Duration::from_secs(30);
        assert!(ledger.begin(UserId(1), &task, Destination::Notion, hold).await.unwrap());
        assert!(!ledger.begin(UserId(1), &task, Destination::Notion, hold).await.unwrap());
        assert!(ledger.begin(UserId(1), &task, Destination::Flomo, hold).await.unwrap());
        ledger.finish(UserId(1), &task, Destination::Notion).await.unwrap();
        assert!(ledger.begin(UserId(1), &task, Destination::Notion, hold).await.unwrap());
    }
}
