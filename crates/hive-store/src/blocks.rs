use hive_core::types::MediaKind;

use crate::error::{Result, StoreError};
use crate::types::{
    Block, Container, BLOCK_AUTO_DELETE_MAX_SECS, BLOCK_DELAY_MAX_SECS,
};
use crate::Store;

/// Fields supplied when creating a block; `ord` is assigned automatically.
#[derive(Debug, Clone, Default)]
pub struct BlockDraft {
    pub text: Option<String>,
    pub media_ref: Option<String>,
    pub media_kind: Option<MediaKind>,
    pub delay_secs: u32,
    pub auto_delete_secs: u32,
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<Block> {
    let kind_str: String = row.get(1)?;
    let container_kind = crate::types::ContainerKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown container kind {kind_str:?}").into(),
        )
    })?;
    let media_kind: Option<String> = row.get(6)?;
    Ok(Block {
        id: row.get(0)?,
        container: Container::new(container_kind, row.get(2)?),
        ord: row.get(3)?,
        text: row.get(4)?,
        media_ref: row.get(5)?,
        media_kind: media_kind.as_deref().and_then(MediaKind::parse),
        delay_secs: row.get::<_, i64>(7)? as u32,
        auto_delete_secs: row.get::<_, i64>(8)? as u32,
    })
}

const BLOCK_COLUMNS: &str =
    "id, container_kind, container_id, ord, text, media_ref, media_kind, delay_secs, auto_delete_secs";

impl Store {
    /// Append a block at the end of the container's sequence.
    pub fn insert_block(&self, container: Container, draft: BlockDraft) -> Result<Block> {
        if draft.delay_secs > BLOCK_DELAY_MAX_SECS {
            return Err(StoreError::Invalid(format!(
                "delay {}s exceeds the {BLOCK_DELAY_MAX_SECS}s maximum",
                draft.delay_secs
            )));
        }
        if draft.auto_delete_secs > BLOCK_AUTO_DELETE_MAX_SECS {
            return Err(StoreError::Invalid(format!(
                "auto-delete {}s exceeds the {BLOCK_AUTO_DELETE_MAX_SECS}s maximum",
                draft.auto_delete_secs
            )));
        }
        if draft.text.is_none() && draft.media_ref.is_none() {
            return Err(StoreError::Invalid("block needs text or media".into()));
        }

        let conn = self.conn();
        let next_ord: i64 = conn.query_row(
            "SELECT COALESCE(MAX(ord), 0) + 1 FROM blocks
             WHERE container_kind = ?1 AND container_id = ?2",
            rusqlite::params![container.kind.as_str(), container.id],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO blocks
             (container_kind, container_id, ord, text, media_ref, media_kind,
              delay_secs, auto_delete_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                container.kind.as_str(),
                container.id,
                next_ord,
                draft.text,
                draft.media_ref,
                draft.media_kind.map(|k| k.as_str()),
                draft.delay_secs,
                draft.auto_delete_secs,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Block {
            id,
            container,
            ord: next_ord,
            text: draft.text,
            media_ref: draft.media_ref,
            media_kind: draft.media_kind,
            delay_secs: draft.delay_secs,
            auto_delete_secs: draft.auto_delete_secs,
        })
    }

    /// Blocks of a container in send order.
    pub fn list_blocks(&self, container: Container) -> Result<Vec<Block>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks
             WHERE container_kind = ?1 AND container_id = ?2
             ORDER BY ord"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![container.kind.as_str(), container.id],
            row_to_block,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Delete a block and close the ordering gap so the sequence stays
    /// contiguous.
    pub fn delete_block(&self, block_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let (kind, container_id, ord): (String, i64, i64) = tx
            .query_row(
                "SELECT container_kind, container_id, ord FROM blocks WHERE id = ?1",
                [block_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .map_err(|_| StoreError::NotFound(format!("block {block_id}")))?;

        tx.execute("DELETE FROM blocks WHERE id = ?1", [block_id])?;
        tx.execute(
            "UPDATE blocks SET ord = ord - 1
             WHERE container_kind = ?1 AND container_id = ?2 AND ord > ?3",
            rusqlite::params![kind, container_id, ord],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContainerKind;

    fn text_block(t: &str) -> BlockDraft {
        BlockDraft {
            text: Some(t.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn blocks_keep_insertion_order() {
        let store = Store::open_in_memory().unwrap();
        let c = Container::new(ContainerKind::OfferPitch, 7);
        store.insert_block(c, text_block("one")).unwrap();
        store.insert_block(c, text_block("two")).unwrap();
        store.insert_block(c, text_block("three")).unwrap();

        let blocks = store.list_blocks(c).unwrap();
        let texts: Vec<_> = blocks.iter().map(|b| b.text.as_deref().unwrap()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert_eq!(blocks.iter().map(|b| b.ord).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn delete_closes_order_gap() {
        let store = Store::open_in_memory().unwrap();
        let c = Container::new(ContainerKind::Start, 42);
        store.insert_block(c, text_block("a")).unwrap();
        let middle = store.insert_block(c, text_block("b")).unwrap();
        store.insert_block(c, text_block("c")).unwrap();

        store.delete_block(middle.id).unwrap();

        let blocks = store.list_blocks(c).unwrap();
        assert_eq!(blocks.iter().map(|b| b.ord).collect::<Vec<_>>(), vec![1, 2]);
        let texts: Vec<_> = blocks.iter().map(|b| b.text.as_deref().unwrap()).collect();
        assert_eq!(texts, vec!["a", "c"]);
    }

    #[test]
    fn delay_out_of_range_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let c = Container::new(ContainerKind::Action, 1);
        let draft = BlockDraft {
            text: Some("x".into()),
            delay_secs: 301,
            ..Default::default()
        };
        assert!(matches!(
            store.insert_block(c, draft),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn empty_block_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let c = Container::new(ContainerKind::Action, 1);
        assert!(store.insert_block(c, BlockDraft::default()).is_err());
    }
}
