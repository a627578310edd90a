//! Large object externalization.
//!
//! Each large object is cut into fixed-size blocks written to an auxiliary
//! `(id, pos, val)` table; the main row only keeps the id.

use std::io::{ErrorKind, Read};

use crate::core::value::{Row, TargetValue};
use crate::error::{ImportError, Result};
use crate::transfer::BatchUploader;

/// Bytes per auxiliary row.
pub const BLOB_BLOCK_SIZE: usize = 64 * 1024;

/// Chunk writer for one large-object column of one table load.
pub struct BlobSaver {
    uploader: BatchUploader,
    max_rows: usize,
    buffer: Vec<Row>,
    last_id: i64,
}

impl BlobSaver {
    pub fn new(uploader: BatchUploader, max_rows: usize) -> Self {
        let max_rows = max_rows.max(1);
        Self {
            uploader,
            max_rows,
            buffer: Vec::with_capacity(max_rows),
            last_id: 0,
        }
    }

    /// Allocate the id for the next large object. Ids start at 1 and are
    /// unique within this column's auxiliary table only.
    pub fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    pub fn path(&self) -> &str {
        self.uploader.path()
    }

    /// Copy one large object into auxiliary rows. An empty object yields no
    /// rows.
    pub fn save_blob(&mut self, id: i64, stream: &mut dyn Read) -> Result<()> {
        let mut pos: i32 = 0;
        loop {
            let block = read_block(stream)?;
            if block.is_empty() {
                return Ok(());
            }
            let full = block.len() == BLOB_BLOCK_SIZE;
            self.buffer.push(vec![
                TargetValue::Int64(id),
                TargetValue::Int32(pos),
                TargetValue::Bytes(block),
            ]);
            if self.buffer.len() >= self.max_rows {
                self.flush()?;
            }
            if !full {
                return Ok(());
            }
            pos += 1;
        }
    }

    /// Write buffered rows. Must be called once the source is exhausted.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.uploader.upload(&self.buffer)?;
        self.buffer.clear();
        Ok(())
    }
}

/// Read until the block is full or the stream ends.
fn read_block(stream: &mut dyn Read) -> Result<Vec<u8>> {
    let mut block = vec![0u8; BLOB_BLOCK_SIZE];
    let mut filled = 0;
    while filled < BLOB_BLOCK_SIZE {
        match stream.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ImportError::Io(e)),
        }
    }
    block.truncate(filled);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{blob_fields, MemoryTarget, TargetStore};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const DDL: &str = "CREATE TABLE `db/t_photo` (\n  `id` Int64 NOT NULL,\n  `pos` Int32 NOT NULL,\n  `val` Bytes NOT NULL,\n  PRIMARY KEY (`id`, `pos`)\n);\n";

    fn saver(store: &Arc<MemoryTarget>, max_rows: usize) -> (BlobSaver, Arc<AtomicU64>) {
        store.execute_schema(DDL).unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        let uploader = BatchUploader::new(
            store.clone(),
            "db/t_photo".into(),
            blob_fields(),
            counter.clone(),
            "s.t photo".into(),
        );
        (BlobSaver::new(uploader, max_rows), counter)
    }

    fn reassemble(rows: &[Row], id: i64) -> Vec<u8> {
        let mut chunks: Vec<(i32, &[u8])> = rows
            .iter()
            .filter(|r| r[0].as_i64() == Some(id))
            .map(|r| (r[1].as_i32().unwrap(), r[2].as_bytes().unwrap()))
            .collect();
        chunks.sort_by_key(|(pos, _)| *pos);
        chunks.into_iter().flat_map(|(_, b)| b.to_vec()).collect()
    }

    /// Hands out data a few bytes at a time.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.0.len().min(buf.len()).min(1000);
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_chunking_reproduces_input() {
        for size in [0usize, 1, BLOB_BLOCK_SIZE, BLOB_BLOCK_SIZE + 1, 3 * BLOB_BLOCK_SIZE + 17] {
            let store = Arc::new(MemoryTarget::new());
            let (mut saver, _) = saver(&store, 100);
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let id = saver.next_id();
            saver.save_blob(id, &mut Cursor::new(data.clone())).unwrap();
            saver.flush().unwrap();

            let rows = store.rows("db/t_photo");
            assert_eq!(rows.len(), size.div_ceil(BLOB_BLOCK_SIZE), "size {}", size);
            assert_eq!(reassemble(&rows, id), data, "size {}", size);
        }
    }

    #[test]
    fn test_short_reads_fill_whole_blocks() {
        let store = Arc::new(MemoryTarget::new());
        let (mut saver, _) = saver(&store, 100);
        let data = vec![7u8; BLOB_BLOCK_SIZE + 5];
        saver.save_blob(1, &mut Trickle(&data)).unwrap();
        saver.flush().unwrap();
        let rows = store.rows("db/t_photo");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][2].as_bytes().unwrap().len(), BLOB_BLOCK_SIZE);
        assert_eq!(rows[1][1], TargetValue::Int32(1));
    }

    #[test]
    fn test_flushes_at_threshold_and_on_demand() {
        let store = Arc::new(MemoryTarget::new());
        let (mut saver, counter) = saver(&store, 2);
        for _ in 0..3 {
            let id = saver.next_id();
            saver.save_blob(id, &mut Cursor::new(vec![1u8; 10])).unwrap();
        }
        assert_eq!(store.upload_sizes("db/t_photo"), vec![2]);
        saver.flush().unwrap();
        saver.flush().unwrap();
        assert_eq!(store.upload_sizes("db/t_photo"), vec![2, 1]);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_ids_are_sequential() {
        let store = Arc::new(MemoryTarget::new());
        let (mut saver, _) = saver(&store, 10);
        assert_eq!(saver.next_id(), 1);
        assert_eq!(saver.next_id(), 2);
    }
}
