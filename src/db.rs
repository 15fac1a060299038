use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::models::{Marketplace, PersistedPost, PersistedPostPatch, Search, SearchRow, SearchStatus};

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

/// Values for a new `searches` row.
#[derive(Debug, Clone, Default)]
pub struct NewSearch {
    pub marketplace: String,
    pub url: String,
    pub search_string: String,
    pub status: i64,
    pub price_low: Option<i64>,
    pub price_high: Option<i64>,
    pub price_target: Option<i64>,
    pub price_info: Option<String>,
    pub zipcodes: Option<String>,
    pub chat_id: Option<String>,
}

impl Database {
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Ok(Self { conn, path })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn conn_for_tests(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn default_path() -> Result<PathBuf> {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "kleinalert") {
            Ok(proj_dirs.data_dir().join("kleinalert.db"))
        } else {
            Ok(PathBuf::from("kleinalert.db"))
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS searches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                marketplace TEXT NOT NULL CHECK (marketplace IN ('KLEIN', 'EBAY')),
                url TEXT NOT NULL DEFAULT '',
                search_string TEXT NOT NULL DEFAULT '',
                status INTEGER NOT NULL DEFAULT 1 CHECK (status IN (0, 1, 2)),
                price_low INTEGER,
                price_high INTEGER,
                price_target INTEGER,
                price_info TEXT,
                zipcodes TEXT,
                chat_id TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS klein_posts (
                post_id TEXT PRIMARY KEY,
                price TEXT NOT NULL,
                link_id INTEGER REFERENCES searches(id),
                title TEXT NOT NULL,
                shipping TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS ebay_posts (
                post_id TEXT PRIMARY KEY,
                price TEXT NOT NULL,
                link_id INTEGER REFERENCES searches(id),
                title TEXT NOT NULL,
                shipping TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_klein_posts_link ON klein_posts(link_id);
            CREATE INDEX IF NOT EXISTS idx_ebay_posts_link ON ebay_posts(link_id);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='searches'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!(
                "Database not initialized. Run 'kleinalert init' first."
            ));
        }
        Ok(())
    }

    // --- Post operations ---

    pub fn get_post(&self, marketplace: Marketplace, post_id: &str) -> Result<Option<PersistedPost>> {
        let sql = format!(
            "SELECT post_id, price, link_id, title, shipping FROM {} WHERE post_id = ?1",
            marketplace.post_table()
        );
        self.conn
            .query_row(&sql, [post_id], |row| Self::row_to_post(row, marketplace))
            .optional()
            .with_context(|| format!("Failed to look up {} post {}", marketplace, post_id))
    }

    /// Posts not yet claimed by any search.
    pub fn unlinked_posts(&self, marketplace: Marketplace) -> Result<Vec<PersistedPost>> {
        let sql = format!(
            "SELECT post_id, price, link_id, title, shipping FROM {} WHERE link_id IS NULL ORDER BY created_at, post_id",
            marketplace.post_table()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| Self::row_to_post(row, marketplace))?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list unlinked posts")
    }

    pub fn create_post(&self, post: &PersistedPost) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (post_id, price, link_id, title, shipping) VALUES (?1, ?2, ?3, ?4, ?5)",
            post.marketplace.post_table()
        );
        self.conn
            .execute(
                &sql,
                params![post.post_id, post.price, post.link_id, post.title, post.shipping],
            )
            .with_context(|| format!("Failed to create {} post {}", post.marketplace, post.post_id))?;
        Ok(())
    }

    pub fn update_post(
        &self,
        marketplace: Marketplace,
        post_id: &str,
        patch: &PersistedPostPatch,
    ) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut assignments = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(price) = &patch.price {
            values.push(Value::Text(price.clone()));
            assignments.push(format!("price = ?{}", values.len()));
        }
        if let Some(link_id) = patch.link_id {
            values.push(Value::Integer(link_id));
            assignments.push(format!("link_id = ?{}", values.len()));
        }
        values.push(Value::Text(post_id.to_string()));

        let sql = format!(
            "UPDATE {} SET {}, updated_at = datetime('now') WHERE post_id = ?{}",
            marketplace.post_table(),
            assignments.join(", "),
            values.len()
        );

        let changed = self
            .conn
            .execute(&sql, params_from_iter(values))
            .with_context(|| format!("Failed to update {} post {}", marketplace, post_id))?;
        if changed == 0 {
            return Err(anyhow!("{} post {} not found", marketplace, post_id));
        }
        Ok(())
    }

    fn row_to_post(row: &rusqlite::Row, marketplace: Marketplace) -> rusqlite::Result<PersistedPost> {
        Ok(PersistedPost {
            post_id: row.get(0)?,
            marketplace,
            price: row.get(1)?,
            link_id: row.get(2)?,
            title: row.get(3)?,
            shipping: row.get(4)?,
        })
    }

    // --- Search operations ---

    pub fn list_search_rows(&self) -> Result<Vec<SearchRow>> {
        // EBAY sorts before KLEIN so marketplace-B rows are ingested before they are matched
        let mut stmt = self.conn.prepare(
            "SELECT id, marketplace, url, search_string, status, price_low, price_high,
                    price_target, price_info, zipcodes, chat_id
             FROM searches
             ORDER BY marketplace ASC, price_low DESC, price_target DESC, id ASC",
        )?;
        let rows = stmt.query_map([], Self::row_to_search)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list searches")
    }

    pub fn get_search(&self, id: i64) -> Result<Option<Search>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, marketplace, url, search_string, status, price_low, price_high,
                        price_target, price_info, zipcodes, chat_id
                 FROM searches WHERE id = ?1",
                [id],
                Self::row_to_search,
            )
            .optional()?;
        row.map(Search::try_from).transpose()
    }

    pub fn add_search(&self, search: &NewSearch) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO searches (marketplace, url, search_string, status, price_low, price_high,
                                   price_target, price_info, zipcodes, chat_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                search.marketplace,
                search.url,
                search.search_string,
                search.status,
                search.price_low,
                search.price_high,
                search.price_target,
                search.price_info,
                search.zipcodes,
                search.chat_id
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_search_status(&self, id: i64, status: SearchStatus) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE searches SET status = ?1 WHERE id = ?2",
            params![status.code(), id],
        )?;
        if changed == 0 {
            return Err(anyhow!("Search #{} not found", id));
        }
        Ok(())
    }

    /// Deletes the search row. Posts it claimed keep their `link_id`.
    pub fn remove_search(&self, id: i64) -> Result<bool> {
        let changed = self.conn.execute("DELETE FROM searches WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    fn row_to_search(row: &rusqlite::Row) -> rusqlite::Result<SearchRow> {
        Ok(SearchRow {
            id: row.get(0)?,
            marketplace: row.get(1)?,
            url: row.get(2)?,
            search_string: row.get(3)?,
            status: row.get(4)?,
            price_low: row.get(5)?,
            price_high: row.get(6)?,
            price_target: row.get(7)?,
            price_info: row.get(8)?,
            zipcodes: row.get(9)?,
            chat_id: row.get(10)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(post_id: &str, marketplace: Marketplace, link_id: Option<i64>) -> PersistedPost {
        PersistedPost {
            post_id: post_id.to_string(),
            marketplace,
            price: "100 €".to_string(),
            link_id,
            title: "RTX 3080".to_string(),
            shipping: Some("No Shipping".to_string()),
        }
    }

    fn range_search(marketplace: &str, low: i64) -> NewSearch {
        NewSearch {
            marketplace: marketplace.to_string(),
            url: "/s-{PAGENSEARCH}k0".to_string(),
            search_string: "rtx".to_string(),
            status: 1,
            price_low: Some(low),
            price_high: Some(low + 100),
            ..Default::default()
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db.ensure_initialized().unwrap();
    }

    #[test]
    fn test_create_and_get_post() {
        let db = Database::open_in_memory().unwrap();
        let stored = post("555", Marketplace::Klein, Some(1));
        db.create_post(&stored).unwrap();

        assert_eq!(db.get_post(Marketplace::Klein, "555").unwrap(), Some(stored));
        // tables are per marketplace
        assert_eq!(db.get_post(Marketplace::Ebay, "555").unwrap(), None);
    }

    #[test]
    fn test_duplicate_post_id_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.create_post(&post("555", Marketplace::Klein, None)).unwrap();
        assert!(db.create_post(&post("555", Marketplace::Klein, Some(2))).is_err());
    }

    #[test]
    fn test_update_post_touches_only_patched_fields() {
        let db = Database::open_in_memory().unwrap();
        db.create_post(&post("1", Marketplace::Klein, None)).unwrap();

        let patch = PersistedPostPatch {
            link_id: Some(4),
            ..Default::default()
        };
        db.update_post(Marketplace::Klein, "1", &patch).unwrap();
        let stored = db.get_post(Marketplace::Klein, "1").unwrap().unwrap();
        assert_eq!(stored.link_id, Some(4));
        assert_eq!(stored.price, "100 €");

        let patch = PersistedPostPatch {
            price: Some("80 €".to_string()),
            ..Default::default()
        };
        db.update_post(Marketplace::Klein, "1", &patch).unwrap();
        let stored = db.get_post(Marketplace::Klein, "1").unwrap().unwrap();
        assert_eq!(stored.link_id, Some(4));
        assert_eq!(stored.price, "80 €");
    }

    #[test]
    fn test_update_missing_post_fails() {
        let db = Database::open_in_memory().unwrap();
        let patch = PersistedPostPatch {
            price: Some("1 €".to_string()),
            ..Default::default()
        };
        assert!(db.update_post(Marketplace::Ebay, "404", &patch).is_err());
        // empty patch is a no-op
        db.update_post(Marketplace::Ebay, "404", &PersistedPostPatch::default())
            .unwrap();
    }

    #[test]
    fn test_unlinked_posts() {
        let db = Database::open_in_memory().unwrap();
        db.create_post(&post("1", Marketplace::Ebay, None)).unwrap();
        db.create_post(&post("2", Marketplace::Ebay, Some(3))).unwrap();
        db.create_post(&post("3", Marketplace::Klein, None)).unwrap();

        let unlinked = db.unlinked_posts(Marketplace::Ebay).unwrap();
        assert_eq!(unlinked.len(), 1);
        assert_eq!(unlinked[0].post_id, "1");
        assert_eq!(unlinked[0].marketplace, Marketplace::Ebay);
    }

    #[test]
    fn test_search_ordering_puts_ebay_first() {
        let db = Database::open_in_memory().unwrap();
        let klein_low = db.add_search(&range_search("KLEIN", 10)).unwrap();
        let klein_high = db.add_search(&range_search("KLEIN", 500)).unwrap();
        let ebay = db.add_search(&range_search("EBAY", 0)).unwrap();

        let ids: Vec<i64> = db.list_search_rows().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![ebay, klein_high, klein_low]);
    }

    #[test]
    fn test_search_status_and_removal() {
        let db = Database::open_in_memory().unwrap();
        let id = db.add_search(&range_search("KLEIN", 10)).unwrap();
        db.create_post(&post("9", Marketplace::Ebay, Some(id))).unwrap();

        db.set_search_status(id, SearchStatus::Silent).unwrap();
        let search = db.get_search(id).unwrap().unwrap();
        assert_eq!(search.status, SearchStatus::Silent);

        assert!(db.remove_search(id).unwrap());
        assert!(db.get_search(id).unwrap().is_none());
        // claims stay durable
        assert_eq!(db.get_post(Marketplace::Ebay, "9").unwrap().unwrap().link_id, Some(id));
        assert!(db.unlinked_posts(Marketplace::Ebay).unwrap().is_empty());
        assert!(db.set_search_status(id, SearchStatus::Active).is_err());
    }
}
