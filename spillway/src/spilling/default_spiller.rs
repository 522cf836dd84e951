//! Implementation of the [`DefaultSpiller`]

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use memory_block::Address;
use snafu::{OptionExt, ResultExt, ensure};

use super::spill_file::{SpillFileCursor, write_record};
use super::{
    CreateDirectorySnafu, EpisodeInProgressSnafu, NoEpisodeSnafu, RemoveDirectorySnafu, Result,
    Spiller, WriteSnafu,
};
use crate::binary_storage::header::StorageHeader;
use crate::binary_storage::storage::Storage;
use crate::common::types::{HashValue, PartitionId};
use crate::common::uuid::SpillId;
use crate::pair::{NIL, next_pair_at, read_pair};
use crate::partition::Partition;

/// Block of a partition that should be spilled
#[derive(Debug, Clone, Copy)]
struct SpillTask {
    /// Index of the partition in the slice passed to the spiller
    partition: usize,
    /// Index of the block in the chain of the partition
    block: usize,
}

#[derive(Debug)]
struct Episode {
    tasks: Vec<SpillTask>,
    next_task: usize,
    /// Index of the first slot that is not visited in the block of the next task
    next_slot: usize,
    /// Next pair to spill in the chain of the visited slot, NIL if the chain is done
    next_pair: Address,
    /// Hash code of the visited slot
    next_hash: HashValue,
    writers: Vec<Option<(PathBuf, BufWriter<File>)>>,
}

impl Episode {
    fn skip_task(&mut self) {
        self.next_task += 1;
        self.next_slot = 0;
        self.next_pair = NIL;
    }

    /// Skip the blocks without pairs left, the episode is drained as soon as the last
    /// pair is written
    fn skip_drained_tasks(&mut self, partitions: &[Partition]) {
        while self.next_pair == NIL {
            let Some(task) = self.tasks.get(self.next_task) else {
                return;
            };
            let drained = partitions[task.partition]
                .chain()
                .get(task.block)
                .is_none_or(|block| {
                    Storage::occupied_slots(block, self.next_slot)
                        .next()
                        .is_none()
                });
            if !drained {
                return;
            }
            self.skip_task();
        }
    }
}

/// [`DefaultSpiller`] appends the pairs of each partition to its own spill file
/// `partition-{id}.spill`. The files live in a directory `spillway-{uuid}` created in
/// the configured spill directory on the first episode, disposing the spiller removes
/// the whole directory.
///
/// A chunk persists at most `chunk_size` pairs, it may stop in the middle of the
/// pair chain of a slot and the next chunk resumes from there. Spill files are
/// appended across episodes
#[derive(Debug)]
pub struct DefaultSpiller {
    directory: PathBuf,
    directory_created: bool,
    buffer_size: usize,
    chunk_size: usize,
    spilled_partitions: BTreeSet<PartitionId>,
    episode: Option<Episode>,
    spilled_pairs: u64,
}

impl DefaultSpiller {
    /// Create a new spiller that writes files into a unique subdirectory of
    /// `spill_directory`
    pub fn new(spill_directory: impl AsRef<Path>, buffer_size: usize, chunk_size: usize) -> Self {
        let directory = spill_directory
            .as_ref()
            .join(format!("spillway-{}", SpillId::new_v4()));
        Self {
            directory,
            directory_created: false,
            buffer_size: buffer_size.max(1),
            chunk_size: chunk_size.max(1),
            spilled_partitions: BTreeSet::new(),
            episode: None,
            spilled_pairs: 0,
        }
    }

    /// Directory that holds the spill files
    #[inline]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns true if an episode is started and not stopped
    #[inline]
    pub fn is_spilling(&self) -> bool {
        self.episode.is_some()
    }

    fn spill_file_path(directory: &Path, partition: PartitionId) -> PathBuf {
        directory.join(format!("partition-{}.spill", partition))
    }
}

impl Spiller for DefaultSpiller {
    #[tracing::instrument(skip_all, name = "DefaultSpiller::start")]
    fn start(&mut self, partitions: &[Partition]) -> Result<()> {
        ensure!(self.episode.is_none(), EpisodeInProgressSnafu);

        if !self.directory_created {
            std::fs::create_dir_all(&self.directory).context(CreateDirectorySnafu {
                path: &self.directory,
            })?;
            self.directory_created = true;
        }

        let tasks = partitions
            .iter()
            .enumerate()
            .flat_map(|(partition_index, partition)| {
                partition
                    .chain()
                    .iter()
                    .enumerate()
                    .filter(|(_, block)| StorageHeader::load(block).len > 0)
                    .map(move |(block_index, _)| SpillTask {
                        partition: partition_index,
                        block: block_index,
                    })
            })
            .collect::<Vec<_>>();

        tracing::info!(
            "Start spilling `{}` blocks of `{}` partitions into `{}`",
            tasks.len(),
            partitions.len(),
            self.directory.display()
        );

        self.episode = Some(Episode {
            tasks,
            next_task: 0,
            next_slot: 0,
            next_pair: NIL,
            next_hash: 0,
            writers: partitions.iter().map(|_| None).collect(),
        });
        Ok(())
    }

    #[tracing::instrument(skip_all, name = "DefaultSpiller::process_next_chunk")]
    fn process_next_chunk(&mut self, partitions: &[Partition]) -> Result<bool> {
        let episode = self.episode.as_mut().context(NoEpisodeSnafu {
            operation: "process_next_chunk",
        })?;

        let mut written = 0;
        while written < self.chunk_size {
            let Some(task) = episode.tasks.get(episode.next_task).copied() else {
                break;
            };
            let partition = &partitions[task.partition];
            let Some(block) = partition.chain().get(task.block) else {
                episode.skip_task();
                continue;
            };

            if episode.next_pair == NIL {
                let Some((index, slot)) = Storage::occupied_slots(block, episode.next_slot).next()
                else {
                    episode.skip_task();
                    continue;
                };
                let slot = Storage::read_slot(block, slot);
                episode.next_slot = index + 1;
                episode.next_pair = slot.head;
                episode.next_hash = slot.hash_code;
            }

            let (path, writer) = match &mut episode.writers[task.partition] {
                Some(writer) => writer,
                entry => {
                    let path = Self::spill_file_path(&self.directory, partition.id());
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .context(WriteSnafu { path: &path })?;
                    self.spilled_partitions.insert(partition.id());
                    entry.insert((path, BufWriter::with_capacity(self.buffer_size, file)))
                }
            };

            while episode.next_pair != NIL && written < self.chunk_size {
                let pair = read_pair(block, episode.next_pair);
                write_record(writer, path.as_path(), episode.next_hash, pair)?;
                episode.next_pair = next_pair_at(block, episode.next_pair);
                written += 1;
            }
        }

        episode.skip_drained_tasks(partitions);
        self.spilled_pairs += written as u64;
        let remaining = episode.next_task < episode.tasks.len();
        tracing::debug!(
            "Spilled chunk with `{}` pairs, `{}` of `{}` blocks are done",
            written,
            episode.next_task,
            episode.tasks.len()
        );
        Ok(remaining)
    }

    #[tracing::instrument(skip_all, name = "DefaultSpiller::stop")]
    fn stop(&mut self) -> Result<()> {
        let episode = self
            .episode
            .take()
            .context(NoEpisodeSnafu { operation: "stop" })?;
        for (path, mut writer) in episode.writers.into_iter().flatten() {
            writer.flush().context(WriteSnafu { path: &path })?;
        }
        tracing::info!(
            "Stop spilling, `{}` pairs are spilled into `{}`",
            self.spilled_pairs,
            self.directory.display()
        );
        Ok(())
    }

    fn dispose(&mut self) -> Result<()> {
        // Unflushed bytes are dropped with the directory
        self.episode = None;
        self.spilled_partitions.clear();
        if !self.directory_created {
            return Ok(());
        }

        self.directory_created = false;
        match std::fs::remove_dir_all(&self.directory) {
            Ok(()) => {
                tracing::debug!("Remove spill directory `{}`", self.directory.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(RemoveDirectorySnafu {
                path: &self.directory,
            }),
        }
    }

    #[inline]
    fn spilled_pairs(&self) -> u64 {
        self.spilled_pairs
    }

    fn open_spill_file_cursor(&self, partition: PartitionId) -> Result<Option<SpillFileCursor>> {
        if !self.spilled_partitions.contains(&partition) {
            return Ok(None);
        }
        SpillFileCursor::open(Self::spill_file_path(&self.directory, partition)).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use memory_block::chain::MemoryChainingRule;
    use memory_block::context::{MemoryContext, MemoryContextConfig};

    use super::*;
    use crate::binary_storage::comparator::{Comparator, DefaultComparator};
    use crate::pair::{FOOTER_SIZE, Pair};
    use crate::spilling::SpillError;

    fn mock_partitions(count: usize) -> Vec<Partition> {
        let ctx = MemoryContext::try_new(MemoryContextConfig {
            block_size: 2048,
            heap_capacity: 2048 * count,
            native_capacity: 0,
        })
        .unwrap();
        (0..count)
            .map(|id| Partition::try_new(id, Arc::clone(&ctx), MemoryChainingRule::Heap).unwrap())
            .collect()
    }

    fn insert(partition: &mut Partition, key: u64, value: u64) {
        let comparator = DefaultComparator::new();
        let (storage, chain) = partition.parts_mut();
        let block = chain.current_mut().unwrap();
        let pair = Pair::new(key, value);
        let address = block
            .allocate(pair.serialized_size() + FOOTER_SIZE)
            .unwrap();
        pair.write_at(block, address, false);
        let slot = storage.insert_pair(block, address, &comparator).unwrap();
        let hash = comparator.partition_hasher().hash(&key.to_le_bytes());
        storage.set_slot_hash_code(block, slot, hash);
    }

    fn read_all(spiller: &DefaultSpiller, partition: PartitionId) -> Vec<(u64, u64)> {
        let mut cursor = spiller.open_spill_file_cursor(partition).unwrap().unwrap();
        let mut pairs = Vec::new();
        while cursor.advance().unwrap() {
            let pair = cursor.pair().unwrap();
            pairs.push((
                pair.decode_key(false).unwrap(),
                pair.decode_value(false).unwrap(),
            ));
        }
        pairs.sort();
        pairs
    }

    #[test]
    fn test_spill_in_chunks() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut partitions = mock_partitions(2);
        for key in 0..5 {
            insert(&mut partitions[0], key, key);
            insert(&mut partitions[0], key, key + 100);
        }
        insert(&mut partitions[1], 42, 1);

        let mut spiller = DefaultSpiller::new(dir.path(), 64, 3);
        assert!(spiller.open_spill_file_cursor(0).unwrap().is_none());
        spiller.start(&partitions).unwrap();
        assert!(spiller.is_spilling());

        let mut calls = 1;
        while spiller.process_next_chunk(&partitions).unwrap() {
            calls += 1;
        }
        // 3, 3, 3 and 2 pairs, the call writing the last pair reports the end
        assert_eq!(calls, 4);
        assert_eq!(spiller.spilled_pairs(), 11);
        spiller.stop().unwrap();
        assert!(!spiller.is_spilling());

        let mut expected = (0..5).flat_map(|key| [(key, key), (key, key + 100)]).collect::<Vec<_>>();
        expected.sort();
        assert_eq!(read_all(&spiller, 0), expected);
        assert_eq!(read_all(&spiller, 1), [(42, 1)]);

        // Spill files are appended across episodes
        spiller.start(&partitions[1..]).unwrap();
        assert!(!spiller.process_next_chunk(&partitions[1..]).unwrap());
        spiller.stop().unwrap();
        assert_eq!(read_all(&spiller, 1), [(42, 1), (42, 1)]);

        let directory = spiller.directory().to_path_buf();
        assert!(directory.starts_with(dir.path()));
        assert!(directory.exists());
        spiller.dispose().unwrap();
        assert!(!directory.exists());
        assert!(dir.path().exists());
        spiller.dispose().unwrap();
    }

    #[test]
    fn test_chunk_splits_pair_chain() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut partitions = mock_partitions(1);
        // Every pair is chained at the same slot
        for value in 0..20 {
            insert(&mut partitions[0], 1, value);
        }
        assert_eq!(partitions[0].slot_count(), 1);

        let mut spiller = DefaultSpiller::new(dir.path(), 64, 3);
        spiller.start(&partitions).unwrap();
        let mut chunks = Vec::new();
        loop {
            let before = spiller.spilled_pairs();
            let remaining = spiller.process_next_chunk(&partitions).unwrap();
            chunks.push(spiller.spilled_pairs() - before);
            if !remaining {
                break;
            }
        }
        assert_eq!(chunks, [3_u64, 3, 3, 3, 3, 3, 2]);
        spiller.stop().unwrap();

        let expected = (0..20).map(|value| (1, value)).collect::<Vec<_>>();
        assert_eq!(read_all(&spiller, 0), expected);
    }

    #[test]
    fn test_episode_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let partitions = mock_partitions(1);
        let mut spiller = DefaultSpiller::new(dir.path(), 64, 3);
        assert!(matches!(
            spiller.process_next_chunk(&partitions),
            Err(SpillError::NoEpisode { .. })
        ));
        assert!(matches!(spiller.stop(), Err(SpillError::NoEpisode { .. })));

        spiller.start(&partitions).unwrap();
        assert!(matches!(
            spiller.start(&partitions),
            Err(SpillError::EpisodeInProgress)
        ));
        // Empty partitions do not produce any chunk
        assert!(!spiller.process_next_chunk(&partitions).unwrap());
        spiller.stop().unwrap();
        assert!(spiller.open_spill_file_cursor(0).unwrap().is_none());
        spiller.dispose().unwrap();
    }
}
