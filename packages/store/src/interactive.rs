//! Interactive `dialoguer` menu and subcommand handlers for the
//! `chatgraph-conversations` CLI, modeled on
//! `crime_map_conversations::interactive`.

use chatgraph_store_models::{ConversationMeta, Role, StoredMessage};
use dialoguer::{theme::ColorfulTheme, Confirm, Select};

use crate::{ConversationStore, StoreError};

const PAGE_SIZE: usize = 20;

/// Top-level action chosen from the interactive menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationAction {
    List,
    Show,
    Export,
    Delete,
    Quit,
}

const ACTIONS: &[(&str, ConversationAction)] = &[
    ("List conversations", ConversationAction::List),
    ("Show a conversation", ConversationAction::Show),
    ("Export a conversation to text", ConversationAction::Export),
    ("Delete a conversation", ConversationAction::Delete),
    ("Quit", ConversationAction::Quit),
];

/// Prompts the operator for a top-level action.
///
/// # Errors
///
/// Returns an error if the terminal prompt fails.
pub fn prompt_action() -> std::io::Result<ConversationAction> {
    let labels: Vec<&str> = ACTIONS.iter().map(|(label, _)| *label).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("What would you like to do?")
        .items(&labels)
        .default(0)
        .interact()?;
    Ok(ACTIONS[selection].1)
}

enum PickerItem {
    Conversation(ConversationMeta),
    NextPage,
    PrevPage,
    Cancel,
}

fn build_picker_page(conversations: &[ConversationMeta], page: usize) -> (Vec<PickerItem>, Vec<String>) {
    let start = page * PAGE_SIZE;
    let end = (start + PAGE_SIZE).min(conversations.len());

    let mut items = Vec::new();
    let mut labels = Vec::new();

    for meta in &conversations[start..end] {
        labels.push(format!(
            "{} — {} ({})",
            meta.title,
            meta.conversation_id,
            meta.last_modified.format("%Y-%m-%d %H:%M")
        ));
        items.push(PickerItem::Conversation(meta.clone()));
    }

    if end < conversations.len() {
        labels.push("-- next page --".to_string());
        items.push(PickerItem::NextPage);
    }
    if page > 0 {
        labels.push("-- previous page --".to_string());
        items.push(PickerItem::PrevPage);
    }
    labels.push("Cancel".to_string());
    items.push(PickerItem::Cancel);

    (items, labels)
}

/// Paginated picker over every conversation belonging to `user_client_id`.
/// Returns `None` if the operator cancels.
///
/// # Errors
///
/// Returns [`StoreError`] if the store query fails, or an I/O error if the
/// terminal prompt fails.
pub async fn pick_conversation(
    store: &dyn ConversationStore,
    user_client_id: &str,
) -> Result<Option<ConversationMeta>, Box<dyn std::error::Error>> {
    let conversations = store.list_conversations(user_client_id).await?;
    if conversations.is_empty() {
        println!("No conversations found.");
        return Ok(None);
    }

    let mut page = 0;
    loop {
        let (items, labels) = build_picker_page(&conversations, page);
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Pick a conversation")
            .items(&labels)
            .default(0)
            .interact()?;

        match &items[selection] {
            PickerItem::Conversation(meta) => return Ok(Some(meta.clone())),
            PickerItem::NextPage => page += 1,
            PickerItem::PrevPage => page = page.saturating_sub(1),
            PickerItem::Cancel => return Ok(None),
        }
    }
}

/// Lists every conversation for `user_client_id` to stdout.
///
/// # Errors
///
/// Returns [`StoreError`] if the store query fails.
pub async fn handle_list(
    store: &dyn ConversationStore,
    user_client_id: &str,
) -> Result<(), StoreError> {
    let conversations = store.list_conversations(user_client_id).await?;
    if conversations.is_empty() {
        println!("No conversations found.");
        return Ok(());
    }
    for meta in conversations {
        println!(
            "{}  {:<40}  updated {}",
            meta.conversation_id,
            meta.title,
            meta.last_modified.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

/// Prints a conversation's full message history.
///
/// # Errors
///
/// Returns [`StoreError`] if the store query fails.
pub async fn handle_show(
    store: &dyn ConversationStore,
    user_client_id: &str,
    conversation_id: &str,
) -> Result<(), StoreError> {
    let Some(detail) = store.get_conversation(user_client_id, conversation_id).await? else {
        println!("Conversation not found.");
        return Ok(());
    };
    print!("{}", format_conversation(&detail.messages));
    Ok(())
}

/// Writes a conversation's formatted history to `out_path`.
///
/// # Errors
///
/// Returns [`StoreError`] if the store query fails, or propagates an I/O
/// error writing the file.
pub async fn handle_export(
    store: &dyn ConversationStore,
    user_client_id: &str,
    conversation_id: &str,
    out_path: &std::path::Path,
) -> Result<(), StoreError> {
    let Some(detail) = store.get_conversation(user_client_id, conversation_id).await? else {
        println!("Conversation not found.");
        return Ok(());
    };
    std::fs::write(out_path, format_conversation(&detail.messages))?;
    println!("Exported to {}", out_path.display());
    Ok(())
}

/// Deletes a conversation after an interactive confirmation.
///
/// # Errors
///
/// Returns [`StoreError`] if the store delete fails, or an I/O error if the
/// confirmation prompt fails.
pub async fn handle_delete(
    store: &dyn ConversationStore,
    user_client_id: &str,
    conversation_id: &str,
    assume_yes: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !assume_yes {
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Delete conversation {conversation_id}?"))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    let deleted = store.delete_conversation(user_client_id, conversation_id).await?;
    if deleted {
        println!("Deleted.");
    } else {
        println!("Conversation not found.");
    }
    Ok(())
}

/// Formats a conversation for human-readable display, in the style of
/// `crime_map_conversations::format_conversation`.
#[must_use]
pub fn format_conversation(messages: &[StoredMessage]) -> String {
    use std::fmt::Write as _;

    let mut output = String::new();
    for message in messages {
        let label = match message.role {
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
        };
        writeln!(output, "--- {label} (#{}) ---", message.sequence_number).unwrap();
        writeln!(output, "{}", message.content).unwrap();
        if let Some(is_satisfy) = message.is_satisfy {
            writeln!(output, "[evaluation: {}]", if is_satisfy { "satisfied" } else { "unsatisfied" }).unwrap();
        }
        writeln!(output).unwrap();
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_meta(id: &str) -> ConversationMeta {
        ConversationMeta {
            conversation_id: id.to_string(),
            user_client_id: "user-1".to_string(),
            title: format!("conversation {id}"),
            model: "gpt-4.1".to_string(),
            agent_level_llm_overwrite: None,
            created_at: Utc::now(),
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn build_picker_page_adds_next_page_sentinel_when_more_remain() {
        let conversations: Vec<_> = (0..25).map(|i| sample_meta(&i.to_string())).collect();
        let (items, labels) = build_picker_page(&conversations, 0);
        assert_eq!(items.len(), PAGE_SIZE + 2); // page + next + cancel
        assert!(labels.iter().any(|l| l == "-- next page --"));
        assert!(!labels.iter().any(|l| l == "-- previous page --"));
    }

    #[test]
    fn build_picker_page_adds_prev_page_sentinel_on_later_pages() {
        let conversations: Vec<_> = (0..25).map(|i| sample_meta(&i.to_string())).collect();
        let (_items, labels) = build_picker_page(&conversations, 1);
        assert!(labels.iter().any(|l| l == "-- previous page --"));
    }

    #[test]
    fn format_conversation_includes_sequence_numbers() {
        let messages = vec![StoredMessage {
            message_id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            sequence_number: 0,
            role: Role::User,
            content: "hello".to_string(),
            timestamp: Utc::now(),
            is_satisfy: None,
            comment: None,
        }];
        let formatted = format_conversation(&messages);
        assert!(formatted.contains("#0"));
        assert!(formatted.contains("hello"));
    }
}
