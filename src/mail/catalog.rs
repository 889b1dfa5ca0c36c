//! Folder Catalog & role assignment (spec §4.5): turns the raw
//! `list_folders()` result into a role-tagged catalog and the fixed
//! ordering `sync_folders()` hands to the Account Monitor.

use std::collections::HashMap;

use crate::config::Provider;
use crate::error::{Result, SyncError};
use crate::mail::types::{FolderRole, RawFolder};

/// `(account, display_name) → role → catalog entry` after filtering
/// unselectable folders and running role assignment.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub name: String,
    pub role: FolderRole,
}

fn is_unselectable(attributes: &[String]) -> bool {
    attributes.iter().any(|a| {
        let a = a.to_ascii_lowercase();
        a == "\\noselect" || a == "\\nonexistent"
    })
}

fn default_name_map() -> &'static HashMap<&'static str, FolderRole> {
    use std::sync::OnceLock;
    static MAP: OnceLock<HashMap<&'static str, FolderRole>> = OnceLock::new();
    MAP.get_or_init(|| {
        HashMap::from([
            ("inbox", FolderRole::Inbox),
            ("drafts", FolderRole::Drafts),
            ("draft", FolderRole::Drafts),
            ("entwürfe", FolderRole::Drafts),
            ("junk", FolderRole::Spam),
            ("spam", FolderRole::Spam),
            ("archive", FolderRole::Archive),
            ("sent", FolderRole::Sent),
            ("sent items", FolderRole::Sent),
            ("trash", FolderRole::Trash),
        ])
    })
}

fn flag_map() -> &'static HashMap<&'static str, FolderRole> {
    use std::sync::OnceLock;
    static MAP: OnceLock<HashMap<&'static str, FolderRole>> = OnceLock::new();
    MAP.get_or_init(|| {
        HashMap::from([
            ("\\inbox", FolderRole::Inbox),
            ("\\sent", FolderRole::Sent),
            ("\\drafts", FolderRole::Drafts),
            ("\\junk", FolderRole::Spam),
            ("\\trash", FolderRole::Trash),
            ("\\spam", FolderRole::Spam),
            ("\\all", FolderRole::All),
            ("\\flagged", FolderRole::Starred),
            ("\\important", FolderRole::Important),
            ("\\archive", FolderRole::Archive),
        ])
    })
}

/// Display-name guesses for the four **system roles**, used only when
/// the exact-name and flag passes leave one of them unassigned. Matched
/// case-insensitively against the full display name; a guess is applied
/// only if exactly one remaining folder matches it (spec.md §4.5 step 4).
fn localized_name_candidates(role: FolderRole) -> &'static [&'static str] {
    match role {
        FolderRole::Inbox => &["posteingang", "boîte de réception", "bandeja de entrada", "收件箱"],
        FolderRole::Sent => &[
            "gesendete objekte",
            "gesendete",
            "envoyés",
            "elementos enviados",
            "已发送",
        ],
        FolderRole::Trash => &["papierkorb", "corbeille", "papelera", "已删除邮件", "deleted items"],
        FolderRole::Spam => &["junk-e-mail", "indésirables", "correo no deseado", "垃圾邮件"],
        _ => &[],
    }
}

/// Assigns a role to one folder, per the ordered rule list in spec.md
/// §4.5: exact lowercased name, then the default map, then the flag map,
/// then (Gmail only) `\All` and inbox-name normalization.
fn assign_role(raw: &RawFolder) -> FolderRole {
    let lower = raw.name.to_ascii_lowercase();

    if let Some(role) = default_name_map().get(lower.as_str()) {
        return *role;
    }

    for attr in &raw.attributes {
        if let Some(role) = flag_map().get(attr.to_ascii_lowercase().as_str()) {
            return *role;
        }
    }

    FolderRole::None
}

/// Builds the catalog from a raw folder listing: drops unselectable
/// folders, assigns roles, then fills in any of the four system roles
/// still unassigned by matching localized display names (only when the
/// match is unique).
pub fn build_catalog(raw_folders: Vec<RawFolder>, provider: Provider) -> Vec<CatalogEntry> {
    let mut entries: Vec<CatalogEntry> = raw_folders
        .into_iter()
        .filter(|f| !is_unselectable(&f.attributes))
        .map(|f| {
            let mut role = assign_role(&f);
            if provider == Provider::Gmail {
                if f.attributes.iter().any(|a| a.eq_ignore_ascii_case("\\All")) {
                    role = FolderRole::All;
                }
                if f.name.eq_ignore_ascii_case("inbox") {
                    return CatalogEntry { name: "Inbox".to_string(), role: FolderRole::Inbox };
                }
            }
            CatalogEntry { name: f.name, role }
        })
        .collect();

    for role in [FolderRole::Inbox, FolderRole::Sent, FolderRole::Trash, FolderRole::Spam] {
        if entries.iter().any(|e| e.role == role) {
            continue;
        }
        let candidates = localized_name_candidates(role);
        let matches: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                let lower = e.name.to_ascii_lowercase();
                candidates.iter().any(|c| lower == *c)
            })
            .map(|(i, _)| i)
            .collect();
        if matches.len() == 1 {
            entries[matches[0]].role = role;
        }
    }

    entries
}

/// The fixed folder-sync ordering `sync_folders()` hands to the Account
/// Monitor: generic accounts sync inbox, then sent, then everything
/// else; Gmail accounts require `all` (else `GmailSettingError`) and sync
/// only `all`, `trash`, and `spam` — labels mean every other Gmail
/// mailbox (besides those three) is just a view over `all`, not an
/// independent source of truth.
pub fn sync_folders(catalog: &[CatalogEntry], provider: Provider) -> Result<Vec<String>> {
    match provider {
        Provider::Gmail => {
            let all = catalog
                .iter()
                .find(|e| e.role == FolderRole::All)
                .ok_or_else(|| {
                    SyncError::GmailSettingError(
                        String::new(),
                        "no folder carries the \\All attribute; IMAP access may be disabled in Gmail settings".into(),
                    )
                })?;
            let mut order = vec![all.name.clone()];
            for role in [FolderRole::Trash, FolderRole::Spam] {
                if let Some(entry) = catalog.iter().find(|e| e.role == role) {
                    order.push(entry.name.clone());
                }
            }
            Ok(order)
        }
        Provider::Generic => {
            let mut order = Vec::new();
            if let Some(inbox) = catalog.iter().find(|e| e.role == FolderRole::Inbox) {
                order.push(inbox.name.clone());
            }
            if let Some(sent) = catalog.iter().find(|e| e.role == FolderRole::Sent) {
                order.push(sent.name.clone());
            }
            for entry in catalog {
                if entry.role != FolderRole::Inbox && entry.role != FolderRole::Sent {
                    order.push(entry.name.clone());
                }
            }
            Ok(order)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(name: &str, attrs: &[&str]) -> RawFolder {
        RawFolder {
            name: name.to_string(),
            delimiter: Some('/'),
            attributes: attrs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn drops_noselect_folders() {
        let catalog = build_catalog(vec![folder("[Gmail]", &["\\Noselect"])], Provider::Gmail);
        assert!(catalog.is_empty());
    }

    #[test]
    fn exact_name_match_wins_over_guessing() {
        let catalog = build_catalog(vec![folder("Drafts", &[])], Provider::Generic);
        assert_eq!(catalog[0].role, FolderRole::Drafts);
    }

    #[test]
    fn gmail_all_flag_normalizes_inbox_and_wins_role() {
        let catalog = build_catalog(
            vec![folder("INBOX", &[]), folder("[Gmail]/All Mail", &["\\All"])],
            Provider::Gmail,
        );
        assert_eq!(catalog[0].name, "Inbox");
        assert_eq!(catalog[0].role, FolderRole::Inbox);
        assert_eq!(catalog[1].role, FolderRole::All);
    }

    #[test]
    fn localized_name_guess_applies_only_when_unique() {
        let catalog = build_catalog(vec![folder("Papierkorb", &[])], Provider::Generic);
        assert_eq!(catalog[0].role, FolderRole::Trash);
    }

    #[test]
    fn gmail_sync_folders_requires_all_folder() {
        let catalog = build_catalog(vec![folder("INBOX", &[])], Provider::Gmail);
        let err = sync_folders(&catalog, Provider::Gmail).unwrap_err();
        assert!(matches!(err, SyncError::GmailSettingError(_, _)));
    }

    #[test]
    fn gmail_sync_folders_orders_all_trash_spam() {
        let catalog = build_catalog(
            vec![
                folder("[Gmail]/All Mail", &["\\All"]),
                folder("[Gmail]/Trash", &["\\Trash"]),
                folder("[Gmail]/Spam", &["\\Spam"]),
            ],
            Provider::Gmail,
        );
        let order = sync_folders(&catalog, Provider::Gmail).unwrap();
        assert_eq!(order, vec!["[Gmail]/All Mail", "[Gmail]/Trash", "[Gmail]/Spam"]);
    }

    #[test]
    fn generic_sync_folders_puts_inbox_then_sent_then_rest() {
        let catalog = build_catalog(
            vec![folder("Archive", &[]), folder("Sent", &[]), folder("INBOX", &[])],
            Provider::Generic,
        );
        let order = sync_folders(&catalog, Provider::Generic).unwrap();
        assert_eq!(order, vec!["INBOX", "Sent", "Archive"]);
    }
}
