//! KeePass-style group/note tree

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{DatabaseError, DatabaseResult};

/// Previous versions kept per note
pub const MAX_HISTORY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub uid: Uuid,
    /// `None` only for the root group
    pub parent_uid: Option<Uuid>,
    pub title: String,
}

impl Group {
    pub fn new(parent_uid: Uuid, title: impl Into<String>) -> Self {
        Self {
            uid: Uuid::new_v4(),
            parent_uid: Some(parent_uid),
            title: title.into(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub uid: Uuid,
    pub group_uid: Uuid,
    pub title: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub notes: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Older versions, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Note>,
}

impl Note {
    pub fn new(group_uid: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            uid: Uuid::new_v4(),
            group_uid,
            title: title.into(),
            username: String::new(),
            password: String::new(),
            url: String::new(),
            notes: String::new(),
            created: now,
            modified: now,
            history: Vec::new(),
        }
    }

    /// Same note without its history
    fn snapshot(&self) -> Note {
        Note {
            history: Vec::new(),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for Note {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Note")
            .field("uid", &self.uid)
            .field("group_uid", &self.group_uid)
            .field("title", &self.title)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("url", &self.url)
            .field("history", &self.history.len())
            .finish()
    }
}

/// Decrypted payload of a database file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseContent {
    pub name: String,
    pub root_group_uid: Uuid,
    pub groups: Vec<Group>,
    pub notes: Vec<Note>,
}

impl DatabaseContent {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let root = Group {
            uid: Uuid::new_v4(),
            parent_uid: None,
            title: name.clone(),
        };
        Self {
            name,
            root_group_uid: root.uid,
            groups: vec![root],
            notes: Vec::new(),
        }
    }

    pub fn root_group(&self) -> Option<&Group> {
        self.group(self.root_group_uid)
    }

    pub fn group(&self, uid: Uuid) -> Option<&Group> {
        self.groups.iter().find(|g| g.uid == uid)
    }

    pub fn note(&self, uid: Uuid) -> Option<&Note> {
        self.notes.iter().find(|n| n.uid == uid)
    }

    pub fn child_groups(&self, parent: Uuid) -> Vec<&Group> {
        self.groups.iter().filter(|g| g.parent_uid == Some(parent)).collect()
    }

    pub fn notes_in(&self, group: Uuid) -> Vec<&Note> {
        self.notes.iter().filter(|n| n.group_uid == group).collect()
    }

    fn require_group(&self, uid: Uuid) -> DatabaseResult<()> {
        match self.group(uid) {
            Some(_) => Ok(()),
            None => Err(DatabaseError::NotFound(format!("group {}", uid))),
        }
    }

    pub fn insert_group(&mut self, group: Group) -> DatabaseResult<()> {
        let parent = group
            .parent_uid
            .ok_or_else(|| DatabaseError::InvalidOperation("only one root group allowed".to_string()))?;
        self.require_group(parent)?;
        if self.group(group.uid).is_some() {
            return Err(DatabaseError::InvalidOperation(format!("group {} exists", group.uid)));
        }
        self.groups.push(group);
        Ok(())
    }

    pub fn update_group(&mut self, group: Group) -> DatabaseResult<()> {
        if group.uid == self.root_group_uid && group.parent_uid.is_some() {
            return Err(DatabaseError::InvalidOperation("root group can not be moved".to_string()));
        }
        if group.uid != self.root_group_uid && group.parent_uid.is_none() {
            return Err(DatabaseError::InvalidOperation("only one root group allowed".to_string()));
        }
        if let Some(parent) = group.parent_uid {
            self.require_group(parent)?;
            if self.is_descendant(parent, group.uid) {
                return Err(DatabaseError::InvalidOperation("group can not be moved into itself".to_string()));
            }
        }
        let existing = self
            .groups
            .iter_mut()
            .find(|g| g.uid == group.uid)
            .ok_or_else(|| DatabaseError::NotFound(format!("group {}", group.uid)))?;
        *existing = group;
        Ok(())
    }

    /// Whether `uid` is `ancestor` or lies below it
    fn is_descendant(&self, uid: Uuid, ancestor: Uuid) -> bool {
        let mut current = Some(uid);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.group(id).and_then(|g| g.parent_uid);
        }
        false
    }

    /// Remove a group with all subgroups and notes; returns the removed
    /// group and note uids
    pub fn remove_group(&mut self, uid: Uuid) -> DatabaseResult<(Vec<Uuid>, Vec<Uuid>)> {
        if uid == self.root_group_uid {
            return Err(DatabaseError::InvalidOperation("root group can not be removed".to_string()));
        }
        self.require_group(uid)?;

        let groups: Vec<Uuid> = self
            .groups
            .iter()
            .filter(|g| self.is_descendant(g.uid, uid))
            .map(|g| g.uid)
            .collect();
        let notes: Vec<Uuid> = self
            .notes
            .iter()
            .filter(|n| groups.contains(&n.group_uid))
            .map(|n| n.uid)
            .collect();

        self.groups.retain(|g| !groups.contains(&g.uid));
        self.notes.retain(|n| !notes.contains(&n.uid));
        Ok((groups, notes))
    }

    pub fn insert_note(&mut self, note: Note) -> DatabaseResult<()> {
        self.require_group(note.group_uid)?;
        if self.note(note.uid).is_some() {
            return Err(DatabaseError::InvalidOperation(format!("note {} exists", note.uid)));
        }
        self.notes.push(note);
        Ok(())
    }

    /// Replace a note, moving its previous version into history
    pub fn update_note(&mut self, mut note: Note) -> DatabaseResult<()> {
        self.require_group(note.group_uid)?;
        let existing = self
            .notes
            .iter_mut()
            .find(|n| n.uid == note.uid)
            .ok_or_else(|| DatabaseError::NotFound(format!("note {}", note.uid)))?;

        let mut history = std::mem::take(&mut existing.history);
        history.push(existing.snapshot());
        if history.len() > MAX_HISTORY {
            let excess = history.len() - MAX_HISTORY;
            history.drain(..excess);
        }

        note.history = history;
        note.created = existing.created;
        note.modified = Utc::now();
        *existing = note;
        Ok(())
    }

    pub fn remove_note(&mut self, uid: Uuid) -> DatabaseResult<Note> {
        let index = self
            .notes
            .iter()
            .position(|n| n.uid == uid)
            .ok_or_else(|| DatabaseError::NotFound(format!("note {}", uid)))?;
        Ok(self.notes.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_content_has_root() {
        let content = DatabaseContent::new("Vault");
        let root = content.root_group().unwrap();
        assert_eq!(root.title, "Vault");
        assert!(root.parent_uid.is_none());
    }

    #[test]
    fn test_remove_group_is_recursive() {
        let mut content = DatabaseContent::new("Vault");
        let root = content.root_group_uid;
        let email = Group::new(root, "Email");
        let work = Group::new(email.uid, "Work");
        let other = Group::new(root, "Other");
        let (email_uid, work_uid) = (email.uid, work.uid);
        content.insert_group(email).unwrap();
        content.insert_group(work).unwrap();
        content.insert_group(other).unwrap();
        content.insert_note(Note::new(work_uid, "corp mail")).unwrap();
        content.insert_note(Note::new(root, "bank")).unwrap();

        let (groups, notes) = content.remove_group(email_uid).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(notes.len(), 1);
        assert_eq!(content.groups.len(), 2);
        assert_eq!(content.notes.len(), 1);

        assert!(matches!(
            content.remove_group(root),
            Err(DatabaseError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_update_note_keeps_history() {
        let mut content = DatabaseContent::new("Vault");
        let note = Note::new(content.root_group_uid, "bank");
        let uid = note.uid;
        content.insert_note(note).unwrap();

        for i in 0..(MAX_HISTORY + 3) {
            let mut updated = content.note(uid).unwrap().clone();
            updated.password = format!("pw{}", i);
            content.update_note(updated).unwrap();
        }

        let note = content.note(uid).unwrap();
        assert_eq!(note.password, format!("pw{}", MAX_HISTORY + 2));
        assert_eq!(note.history.len(), MAX_HISTORY);
        assert!(note.history.iter().all(|h| h.history.is_empty()));
        assert_eq!(note.history.last().unwrap().password, format!("pw{}", MAX_HISTORY + 1));
    }

    #[test]
    fn test_group_cycles_rejected() {
        let mut content = DatabaseContent::new("Vault");
        let parent = Group::new(content.root_group_uid, "A");
        let child = Group::new(parent.uid, "B");
        let mut moved = parent.clone();
        moved.parent_uid = Some(child.uid);
        content.insert_group(parent).unwrap();
        content.insert_group(child).unwrap();
        assert!(matches!(
            content.update_group(moved),
            Err(DatabaseError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_note_requires_group() {
        let mut content = DatabaseContent::new("Vault");
        assert!(matches!(
            content.insert_note(Note::new(Uuid::new_v4(), "orphan")),
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[test]
    fn test_note_debug_redacts_password() {
        let mut note = Note::new(Uuid::new_v4(), "bank");
        note.password = "hunter22".to_string();
        assert!(!format!("{:?}", note).contains("hunter22"));
    }
}
