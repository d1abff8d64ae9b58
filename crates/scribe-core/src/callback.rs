//! Save-button callback flow.

use std::{sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::{
    domain::{ChatId, MessageRef, TaskId, UserId},
    ledger::{save_keyboard, Destination, SaveAction, SaveLedger, SaveVerb},
    messaging::MessagingPort,
    ports::NoteSink,
    store::{keys, KeyValueStore},
    Error, Result,
};

/// A save-button click as seen by the core.
#[derive(Clone, Debug)]
pub struct SaveClick {
    pub callback_id: String,
    pub user_id: UserId,
    pub chat_id: Option<ChatId>,
    /// Message that carries the keyboard, if Telegram still exposes it.
    pub message: Option<MessageRef>,
    pub data: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(Destination),
    AlreadySaved(Destination),
    /// Another click for the same destination is still saving.
    InProgress,
    /// The cached result is gone.
    Expired,
    Noop,
    Rejected,
    Failed,
}

pub struct SaveCallbackHandler {
    store: Arc<dyn KeyValueStore>,
    ledger: Arc<SaveLedger>,
    messenger: Arc<dyn MessagingPort>,
    flomo: Arc<dyn NoteSink>,
    notion: Arc<dyn NoteSink>,
    in_flight_hold: Duration,
}

impl SaveCallbackHandler {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        ledger: Arc<SaveLedger>,
        messenger: Arc<dyn MessagingPort>,
        flomo: Arc<dyn NoteSink>,
        notion: Arc<dyn NoteSink>,
    ) -> Self {
        Self {
            store,
            ledger,
            messenger,
            flomo,
            notion,
            in_flight_hold: Duration::from_secs(60),
        }
    }

    fn sink(&self, to: Destination) -> &Arc<dyn NoteSink> {
        match to {
            Destination::Flomo => &self.flomo,
            Destination::Notion => &self.notion,
        }
    }

    pub async fn handle(&self, click: &SaveClick) -> Result<SaveOutcome> {
        let action = match SaveAction::parse(&click.data) {
            Ok(a) => a,
            Err(e) => {
                warn!(user_id = %click.user_id, "rejected callback: {e}");
                self.answer(click, Some("Unsupported action")).await;
                return Ok(SaveOutcome::Rejected);
            }
        };
        if action.verb == SaveVerb::Noop {
            self.answer(click, None).await;
            return Ok(SaveOutcome::Noop);
        }

        let (user, task, to) = (click.user_id, &action.task_id, action.to);
        let text = match self.cached_result(task).await {
            Ok(text) => text,
            Err(Error::Expired(what)) => {
                info!(user_id = %user, destination = %to, "save refused: {what} expired");
                self.answer(click, Some("This result has expired")).await;
                return Ok(SaveOutcome::Expired);
            }
            Err(e) => return Err(e),
        };

        if self.ledger.is_saved(user, task, to).await? {
            self.answer(click, Some(&format!("Already saved to {}", to.label())))
                .await;
            self.refresh_keyboard(click, &action).await;
            return Ok(SaveOutcome::AlreadySaved(to));
        }

        if !self.ledger.begin(user, task, to, self.in_flight_hold).await? {
            self.answer(click, Some("Saving, please wait…")).await;
            return Ok(SaveOutcome::InProgress);
        }
        let outcome = self.save_claimed(click, &action, &text).await;
        self.ledger.finish(user, task, to).await?;
        outcome
    }

    async fn save_claimed(&self, click: &SaveClick, action: &SaveAction, text: &str) -> Result<SaveOutcome> {
        let (user, task, to) = (click.user_id, &action.task_id, action.to);
        // A concurrent click may have finished between the first check and the claim.
        if self.ledger.is_saved(user, task, to).await? {
            self.answer(click, Some(&format!("Already saved to {}", to.label())))
                .await;
            return Ok(SaveOutcome::AlreadySaved(to));
        }

        if let Err(e) = self.sink(to).save(text, user).await {
            warn!(user_id = %user, task_id = %task, destination = %to, "save failed: {e}");
            self.answer(click, Some("Save failed, please try again")).await;
            return Ok(SaveOutcome::Failed);
        }
        self.ledger.record(user, task, to).await?;
        info!(user_id = %user, task_id = %task, destination = %to, "result saved");

        self.answer(click, Some(&format!("Saved to {}", to.label())))
            .await;
        if let Some(chat_id) = click.chat_id {
            if let Err(e) = self
                .messenger
                .send_text(chat_id, &format!("Saved to {}.", to.label()), None)
                .await
            {
                warn!(chat_id = chat_id.0, "save confirmation not sent: {e}");
            }
        }
        self.refresh_keyboard(click, action).await;
        Ok(SaveOutcome::Saved(to))
    }

    async fn cached_result(&self, task: &TaskId) -> Result<String> {
        self.store
            .get(&keys::result(task))
            .await?
            .ok_or_else(|| Error::Expired(format!("result of task {task}")))
    }

    /// Re-render the keyboard from the ledger's current state.
    async fn refresh_keyboard(&self, click: &SaveClick, action: &SaveAction) {
        let Some(msg) = click.message else {
            return;
        };
        if let Err(e) = self.edit_keyboard(msg, click.user_id, action).await {
            warn!(task_id = %action.task_id, "keyboard refresh failed: {e}");
        }
    }

    async fn edit_keyboard(&self, msg: MessageRef, user: UserId, action: &SaveAction) -> Result<()> {
        let saved = self.ledger.saved(user, &action.task_id).await?;
        let kb = save_keyboard(&action.task_id, &saved)?;
        self.messenger.edit_keyboard(msg, kb).await
    }

    async fn answer(&self, click: &SaveClick, text: Option<&str>) {
        if let Err(e) = self
            .messenger
            .answer_callback_query(&click.callback_id, text)
            .await
        {
            warn!(callback_id = %click.callback_id, "callback answer failed: {e}");
        }
    }
}
