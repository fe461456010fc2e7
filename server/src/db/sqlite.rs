//! SQLite implementation of the directory and message store interfaces.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::MutexGuard;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::models::{
    DirectMessage, GroupId, GroupMessage, GroupRecord, MessageId, MessageType, NewDirectMessage,
    NewGroup, NewGroupMessage, UserId, UserRecord,
};
use super::DbPool;
use crate::error::StoreError;
use crate::store::{GroupDirectory, MessageStore, StoreResult, UserDirectory};

#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Insert or refresh a directory user. Account registration lives outside
    /// this server; this seeds the directory it reads from.
    pub fn upsert_user(&self, user_id: &str, username: &str, avatar: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (id, username, avatar, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET username = excluded.username, avatar = excluded.avatar",
            params![user_id, username, avatar, now()],
        )?;
        Ok(())
    }
}

/// Fixed-width timestamps so `ORDER BY created_at` is chronological.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now() -> String {
    timestamp(Utc::now())
}

/// Stored `created_at` column. A value that is not RFC3339 fails the row.
struct Timestamp(DateTime<Utc>);

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .map(|t| Timestamp(t.with_timezone(&Utc)))
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl FromSql for MessageType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        MessageType::parse(raw)
            .ok_or_else(|| FromSqlError::Other(format!("unknown message type {raw:?}").into()))
    }
}

fn string_set(conn: &Connection, sql: &str, key: &str) -> StoreResult<BTreeSet<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
    let mut out = BTreeSet::new();
    for row in rows {
        out.insert(row?);
    }
    Ok(out)
}

fn direct_from_row(row: &Row<'_>) -> rusqlite::Result<DirectMessage> {
    Ok(DirectMessage {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        message: row.get(3)?,
        message_type: row.get(4)?,
        is_read: row.get(5)?,
        is_delivered: row.get(6)?,
        is_blocked: row.get(7)?,
        is_deleted: row.get(8)?,
        created_at: row.get::<_, Timestamp>(9)?.0,
    })
}

const DIRECT_COLUMNS: &str = "id, sender_id, receiver_id, message, message_type, is_read, \
                              is_delivered, is_blocked, is_deleted, created_at";

impl UserDirectory for SqliteStore {
    fn get_user(&self, user_id: &str) -> StoreResult<Option<UserRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, username, avatar FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, username, avatar)) = row else {
            return Ok(None);
        };

        let groups = string_set(
            &conn,
            "SELECT group_id FROM group_members WHERE user_id = ?1",
            &id,
        )?;
        let blocked = string_set(
            &conn,
            "SELECT blocked_id FROM blocks WHERE blocker_id = ?1",
            &id,
        )?;

        Ok(Some(UserRecord {
            id,
            username,
            avatar,
            groups,
            blocked,
        }))
    }

    fn is_blocked(&self, blocker: &str, candidate: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let blocked = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2)",
            params![blocker, candidate],
            |row| row.get::<_, bool>(0),
        )?;
        Ok(blocked)
    }

    fn block(&self, blocker: &str, target: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO blocks (blocker_id, blocked_id, created_at) VALUES (?1, ?2, ?3)",
            params![blocker, target, now()],
        )?;
        Ok(changed > 0)
    }

    fn unblock(&self, blocker: &str, target: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2",
            params![blocker, target],
        )?;
        Ok(changed > 0)
    }
}

impl GroupDirectory for SqliteStore {
    fn get_group(&self, group_id: &str) -> StoreResult<Option<GroupRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, handle, description, created_by, is_private, group_icon
                 FROM chat_groups WHERE id = ?1",
                params![group_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, name, handle, description, created_by, is_private, group_icon)) = row else {
            return Ok(None);
        };

        let members = string_set(
            &conn,
            "SELECT user_id FROM group_members WHERE group_id = ?1",
            &id,
        )?;
        let admins = string_set(
            &conn,
            "SELECT user_id FROM group_admins WHERE group_id = ?1",
            &id,
        )?;

        let mut display_names = BTreeMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT user_id, display_name FROM group_display_names WHERE group_id = ?1",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (user_id, display_name) = row?;
                display_names.insert(user_id, display_name);
            }
        }

        Ok(Some(GroupRecord {
            id,
            name,
            handle,
            description,
            created_by,
            is_private,
            group_icon,
            members,
            admins,
            display_names,
        }))
    }

    fn find_group_by_handle(&self, handle: &str) -> StoreResult<Option<GroupId>> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "SELECT id FROM chat_groups WHERE handle = ?1",
                params![handle],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(id)
    }

    fn create_group(&self, group: &NewGroup) -> StoreResult<GroupRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let id = Uuid::now_v7().to_string();
        let created_at = now();

        tx.execute(
            "INSERT INTO chat_groups (id, name, handle, description, created_by, is_private, group_icon, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                group.name,
                group.handle,
                group.description,
                group.created_by,
                group.is_private,
                group.group_icon,
                created_at
            ],
        )?;

        let mut members = group.members.clone();
        members.insert(group.created_by.clone());
        for member in &members {
            tx.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                params![id, member, created_at],
            )?;
        }
        tx.execute(
            "INSERT OR IGNORE INTO group_admins (group_id, user_id) VALUES (?1, ?2)",
            params![id, group.created_by],
        )?;
        tx.commit()?;

        Ok(GroupRecord {
            id,
            name: group.name.clone(),
            handle: group.handle.clone(),
            description: group.description.clone(),
            created_by: group.created_by.clone(),
            is_private: group.is_private,
            group_icon: group.group_icon.clone(),
            members,
            admins: BTreeSet::from([group.created_by.clone()]),
            display_names: BTreeMap::new(),
        })
    }

    fn add_member(&self, group_id: &str, user_id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
            params![group_id, user_id, now()],
        )?;
        Ok(changed > 0)
    }

    fn remove_member(&self, group_id: &str, user_id: &str) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, user_id],
        )?;
        tx.execute(
            "DELETE FROM group_admins WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, user_id],
        )?;
        tx.execute(
            "DELETE FROM group_display_names WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, user_id],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    fn set_display_name(
        &self,
        group_id: &str,
        user_id: &str,
        display_name: &str,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO group_display_names (group_id, user_id, display_name) VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id, user_id) DO UPDATE SET display_name = excluded.display_name",
            params![group_id, user_id, display_name],
        )?;
        Ok(())
    }
}

impl MessageStore for SqliteStore {
    fn append_direct_message(&self, message: &NewDirectMessage) -> StoreResult<DirectMessage> {
        let conn = self.conn()?;
        let stored = DirectMessage {
            id: Uuid::now_v7().to_string(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            message: message.message.clone(),
            message_type: message.message_type,
            is_read: false,
            // A blocked message is never delivered, whatever the caller decided.
            is_delivered: message.is_delivered && !message.is_blocked,
            is_blocked: message.is_blocked,
            is_deleted: false,
            created_at: Utc::now(),
        };

        conn.execute(
            "INSERT INTO direct_messages
                (id, sender_id, receiver_id, message, message_type, is_read, is_delivered, is_blocked, is_deleted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, 0, ?8)",
            params![
                stored.id,
                stored.sender_id,
                stored.receiver_id,
                stored.message,
                stored.message_type.as_str(),
                stored.is_delivered,
                stored.is_blocked,
                timestamp(stored.created_at)
            ],
        )?;

        Ok(stored)
    }

    fn get_direct_message(&self, message_id: &str) -> StoreResult<Option<DirectMessage>> {
        let conn = self.conn()?;
        let message = conn
            .query_row(
                &format!("SELECT {DIRECT_COLUMNS} FROM direct_messages WHERE id = ?1"),
                params![message_id],
                direct_from_row,
            )
            .optional()?;
        Ok(message)
    }

    fn find_undelivered_direct(&self, recipient: &str) -> StoreResult<Vec<(UserId, MessageId)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sender_id, id FROM direct_messages
             WHERE receiver_id = ?1 AND is_delivered = 0 AND is_blocked = 0
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![recipient], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn mark_direct_delivered(&self, message_ids: &[MessageId]) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        for id in message_ids {
            changed += tx.execute(
                "UPDATE direct_messages SET is_delivered = 1
                 WHERE id = ?1 AND is_delivered = 0 AND is_blocked = 0",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    fn find_unread_direct(&self, sender: &str, reader: &str) -> StoreResult<Vec<MessageId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM direct_messages
             WHERE sender_id = ?1 AND receiver_id = ?2 AND is_read = 0 AND is_blocked = 0
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![sender, reader], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn mark_direct_read(&self, message_ids: &[MessageId]) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        for id in message_ids {
            changed += tx.execute(
                "UPDATE direct_messages SET is_read = 1, is_delivered = 1
                 WHERE id = ?1 AND is_read = 0 AND is_blocked = 0",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    fn delete_direct_message(&self, message_id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE direct_messages SET is_deleted = 1 WHERE id = ?1 AND is_deleted = 0",
            params![message_id],
        )?;
        Ok(changed > 0)
    }

    fn append_group_message(&self, message: &NewGroupMessage) -> StoreResult<GroupMessage> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let id = Uuid::now_v7().to_string();
        let created_at = Utc::now();

        tx.execute(
            "INSERT INTO group_messages (id, group_id, sender_id, message, message_type, is_notification, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                message.group_id,
                message.sender_id,
                message.message,
                message.message_type.as_str(),
                message.is_notification,
                timestamp(created_at)
            ],
        )?;

        // Read implies delivered.
        let mut delivered_to = message.delivered_to.clone();
        delivered_to.extend(message.read_by.iter().cloned());

        for user in &delivered_to {
            tx.execute(
                "INSERT OR IGNORE INTO group_message_delivered (message_id, user_id) VALUES (?1, ?2)",
                params![id, user],
            )?;
        }
        for user in &message.read_by {
            tx.execute(
                "INSERT OR IGNORE INTO group_message_read (message_id, user_id) VALUES (?1, ?2)",
                params![id, user],
            )?;
        }
        tx.commit()?;

        Ok(GroupMessage {
            id,
            group_id: message.group_id.clone(),
            sender_id: message.sender_id.clone(),
            message: message.message.clone(),
            message_type: message.message_type,
            is_notification: message.is_notification,
            delivered_to,
            read_by: message.read_by.clone(),
            created_at,
        })
    }

    fn get_group_message(&self, message_id: &str) -> StoreResult<Option<GroupMessage>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, group_id, sender_id, message, message_type, is_notification, created_at
                 FROM group_messages WHERE id = ?1",
                params![message_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, MessageType>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, Timestamp>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, group_id, sender_id, message, message_type, is_notification, created_at)) =
            row
        else {
            return Ok(None);
        };

        let delivered_to = string_set(
            &conn,
            "SELECT user_id FROM group_message_delivered WHERE message_id = ?1",
            &id,
        )?;
        let read_by = string_set(
            &conn,
            "SELECT user_id FROM group_message_read WHERE message_id = ?1",
            &id,
        )?;

        Ok(Some(GroupMessage {
            id,
            group_id,
            sender_id,
            message,
            message_type,
            is_notification,
            delivered_to,
            read_by,
            created_at: created_at.0,
        }))
    }

    fn find_undelivered_group(
        &self,
        user_id: &str,
        groups: &[GroupId],
    ) -> StoreResult<Vec<(GroupId, MessageId)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.group_id, m.id FROM group_messages m
             WHERE m.group_id = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM group_message_delivered d
                   WHERE d.message_id = m.id AND d.user_id = ?2
               )
             ORDER BY m.created_at ASC, m.id ASC",
        )?;
        let mut out = Vec::new();
        for group_id in groups {
            let rows = stmt.query_map(params![group_id, user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    fn add_group_delivered(
        &self,
        message_id: &str,
        users: &BTreeSet<UserId>,
    ) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        for user in users {
            changed += tx.execute(
                "INSERT OR IGNORE INTO group_message_delivered (message_id, user_id) VALUES (?1, ?2)",
                params![message_id, user],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    fn mark_group_delivered(&self, user_id: &str, message_ids: &[MessageId]) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        for id in message_ids {
            changed += tx.execute(
                "INSERT OR IGNORE INTO group_message_delivered (message_id, user_id) VALUES (?1, ?2)",
                params![id, user_id],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    fn find_unread_group(&self, group_id: &str, user_id: &str) -> StoreResult<Vec<MessageId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.id FROM group_messages m
             WHERE m.group_id = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM group_message_read r
                   WHERE r.message_id = m.id AND r.user_id = ?2
               )
             ORDER BY m.created_at ASC, m.id ASC",
        )?;
        let rows = stmt.query_map(params![group_id, user_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn mark_group_read(&self, user_id: &str, message_ids: &[MessageId]) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        for id in message_ids {
            changed += tx.execute(
                "INSERT OR IGNORE INTO group_message_read (message_id, user_id) VALUES (?1, ?2)",
                params![id, user_id],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO group_message_delivered (message_id, user_id) VALUES (?1, ?2)",
                params![id, user_id],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::migrations;
    use std::sync::{Arc, Mutex};

    fn store() -> SqliteStore {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        migrations().to_latest(&mut conn).unwrap();
        let store = SqliteStore::new(Arc::new(Mutex::new(conn)));
        store.upsert_user("alice", "Alice", "").unwrap();
        store.upsert_user("bob", "Bob", "").unwrap();
        store
    }

    fn direct(store: &SqliteStore, blocked: bool) -> DirectMessage {
        store
            .append_direct_message(&NewDirectMessage {
                sender_id: "alice".into(),
                receiver_id: "bob".into(),
                message: "hi".into(),
                message_type: MessageType::Text,
                is_delivered: false,
                is_blocked: blocked,
            })
            .unwrap()
    }

    #[test]
    fn corrupt_rows_surface_as_errors() {
        let store = store();
        let bad_time = direct(&store, false);
        let bad_type = direct(&store, false);
        {
            let conn = store.conn().unwrap();
            conn.execute(
                "UPDATE direct_messages SET created_at = 'yesterday' WHERE id = ?1",
                params![bad_time.id],
            )
            .unwrap();
            conn.execute(
                "UPDATE direct_messages SET message_type = 'hologram' WHERE id = ?1",
                params![bad_type.id],
            )
            .unwrap();
        }

        assert!(matches!(
            store.get_direct_message(&bad_time.id),
            Err(StoreError::Sqlite(_))
        ));
        assert!(matches!(
            store.get_direct_message(&bad_type.id),
            Err(StoreError::Sqlite(_))
        ));
    }

    #[test]
    fn blocked_messages_are_never_marked_delivered() {
        let store = store();
        let msg = direct(&store, true);

        assert!(store.find_undelivered_direct("bob").unwrap().is_empty());
        assert_eq!(store.mark_direct_delivered(&[msg.id.clone()]).unwrap(), 0);
        assert_eq!(store.mark_direct_read(&[msg.id.clone()]).unwrap(), 0);

        let stored = store.get_direct_message(&msg.id).unwrap().unwrap();
        assert!(!stored.is_delivered);
        assert!(!stored.is_read);
    }

    #[test]
    fn read_implies_delivered_for_direct_messages() {
        let store = store();
        let msg = direct(&store, false);

        assert_eq!(store.find_unread_direct("alice", "bob").unwrap(), vec![msg.id.clone()]);
        assert_eq!(store.mark_direct_read(&[msg.id.clone()]).unwrap(), 1);
        assert_eq!(store.mark_direct_read(&[msg.id.clone()]).unwrap(), 0);

        let stored = store.get_direct_message(&msg.id).unwrap().unwrap();
        assert!(stored.is_read && stored.is_delivered);
    }

    #[test]
    fn group_membership_reflects_in_user_record() {
        let store = store();
        let group = store
            .create_group(&NewGroup {
                name: "Rust".into(),
                handle: "rust".into(),
                description: "crabs".into(),
                created_by: "alice".into(),
                members: BTreeSet::from(["bob".to_string()]),
                is_private: false,
                group_icon: None,
            })
            .unwrap();

        let bob = store.get_user("bob").unwrap().unwrap();
        assert!(bob.groups.contains(&group.id));
        assert!(store.is_admin(&group.id, "alice").unwrap());
        assert!(!store.is_admin(&group.id, "bob").unwrap());
        assert_eq!(
            store.find_group_by_handle("rust").unwrap(),
            Some(group.id.clone())
        );

        store.set_display_name(&group.id, "bob", "Bobby").unwrap();
        assert!(store.remove_member(&group.id, "bob").unwrap());
        assert!(!store.remove_member(&group.id, "bob").unwrap());

        let group = store.get_group(&group.id).unwrap().unwrap();
        assert!(!group.is_member("bob"));
        assert!(group.display_names.is_empty());
    }

    #[test]
    fn group_read_and_delivered_sets_only_grow() {
        let store = store();
        let group = store
            .create_group(&NewGroup {
                name: "Rust".into(),
                handle: "rust".into(),
                description: "crabs".into(),
                created_by: "alice".into(),
                members: BTreeSet::from(["bob".to_string()]),
                is_private: false,
                group_icon: None,
            })
            .unwrap();
        let msg = store
            .append_group_message(&NewGroupMessage {
                group_id: group.id.clone(),
                sender_id: "alice".into(),
                message: "hello".into(),
                message_type: MessageType::Text,
                is_notification: false,
                delivered_to: BTreeSet::new(),
                read_by: BTreeSet::from(["alice".to_string()]),
            })
            .unwrap();
        assert_eq!(msg.delivered_to, BTreeSet::from(["alice".to_string()]));

        let pending = store
            .find_undelivered_group("bob", &[group.id.clone()])
            .unwrap();
        assert_eq!(pending, vec![(group.id.clone(), msg.id.clone())]);

        assert_eq!(store.mark_group_read("bob", &[msg.id.clone()]).unwrap(), 1);
        assert_eq!(store.mark_group_read("bob", &[msg.id.clone()]).unwrap(), 0);

        let stored = store.get_group_message(&msg.id).unwrap().unwrap();
        assert!(stored.read_by.contains("bob"));
        assert!(stored.delivered_to.contains("bob"));
        assert!(store.find_unread_group(&group.id, "bob").unwrap().is_empty());
    }
}
