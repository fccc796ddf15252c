use crate::raft::error::{RaftError, RaftResult};
use crate::raft::raft_common_proto::entry::Data;
use crate::raft::raft_common_proto::entry::Data::{Config, Noop, Payload};
use crate::raft::raft_common_proto::{Entry, EntryId};

// Represents a contiguous slice of a raft log.
pub struct LogSlice {
    entries: Vec<Entry>,

    // The sum of the sizes of all payloads in the stored entries.
    size_bytes: i64,

    // The id of the entry immediately *before* this log slice, or a (-1, -1)
    // sentinel entry if this slice starts at the beginning of time.
    previous_id: EntryId,
}

impl LogSlice {
    // Returns a new instance with the given entries. The "previous_id" parameter
    // holds the id of the last element in the log *not present* in this slice,
    // i.e., the entry immediately before this slice starts.
    pub fn new(previous_id: EntryId, entries: Vec<Entry>) -> RaftResult<Self> {
        let mut next_index = previous_id.index + 1;
        let mut total_size_bytes = 0;
        for entry in &entries {
            let id = entry_id(entry)?;
            if id.index != next_index {
                return Err(RaftError::NonContiguousLog {
                    expected: next_index,
                    actual: id.index,
                });
            }
            total_size_bytes += size_bytes(entry);
            next_index += 1;
        }

        Ok(LogSlice {
            entries,
            size_bytes: total_size_bytes,
            previous_id,
        })
    }

    // Returns a new instance with no entries, starting immediately after the
    // supplied id.
    pub fn new_empty(previous_id: EntryId) -> Self {
        LogSlice {
            entries: Vec::new(),
            size_bytes: 0,
            previous_id,
        }
    }

    // Adds a new entry to the end of the slice. Returns the id of the newly
    // appended entry. Must only be called through the raft store, which keeps
    // track of config entries.
    pub fn append(&mut self, term: i64, data: Data) -> EntryId {
        assert!(term >= self.last_known_id().term);

        let id = EntryId {
            term,
            index: self.next_index(),
        };
        let entry = Entry {
            id: Some(id.clone()),
            data: Some(data),
        };
        self.size_bytes += size_bytes(&entry);
        self.entries.push(entry);
        id
    }

    // Returns the highest id known to exist (even if the entry is not held
    // in this instance).
    pub fn last_known_id(&self) -> &EntryId {
        match self.entries.last().and_then(|e| e.id.as_ref()) {
            Some(id) => id,
            None => &self.previous_id,
        }
    }

    // Returns the id of the entry immediately preceding this slice.
    pub fn previous_id(&self) -> &EntryId {
        &self.previous_id
    }

    // Returns the expected index of the next element added to the log.
    pub fn next_index(&self) -> i64 {
        self.last_known_id().index + 1
    }

    // Returns true if the supplied last entry id is at least as up-to-date
    // as the slice of the log tracked by this instance.
    pub fn is_up_to_date(&self, other_last: &EntryId) -> bool {
        let this_last = self.last_known_id();
        if this_last.term != other_last.term {
            return other_last.term > this_last.term;
        }

        // Terms are equal, last index decides.
        other_last.index >= this_last.index
    }

    // Returns true if the supplied entry id is present in this slice. Both the term and
    // the index need to match for the result to be true.
    pub fn contains(&self, query: &EntryId) -> bool {
        if query.index <= self.previous_id.index || query.index >= self.next_index() {
            return false;
        }
        self.id_at(query.index) == *query
    }

    // Returns a copy of the latest entry containing a config.
    pub fn latest_config_entry(&self) -> Option<Entry> {
        self.latest_config_entry_until(self.last_known_id().index)
    }

    // Returns a copy of the latest entry containing a config whose index is at
    // most the supplied index.
    pub fn latest_config_entry_until(&self, index: i64) -> Option<Entry> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.id.as_ref().is_some_and(|id| id.index <= index))
            .find(|e| matches!(&e.data, Some(Config(_))))
            .cloned()
    }

    // Adds the supplied entries to the slice. Entries already present with a
    // matching term are left alone. The first entry whose term conflicts with
    // ours causes everything from that point on to be replaced. Returns true
    // if the slice was modified.
    //
    // The supplied entries must be contiguous and must not start past the end
    // of this slice, nor before its beginning.
    pub fn append_all(&mut self, entries: &[Entry]) -> RaftResult<bool> {
        let mut modified = false;
        for entry in entries {
            let id = entry_id(entry)?.clone();
            if id.index <= self.previous_id.index {
                return Err(RaftError::Internal(format!(
                    "Cannot append entry {} which precedes the slice start {}",
                    id.index, self.previous_id.index
                )));
            }

            let next = self.next_index();
            if id.index > next {
                return Err(RaftError::NonContiguousLog {
                    expected: next,
                    actual: id.index,
                });
            }

            if id.index < next {
                if self.id_at(id.index).term == id.term {
                    continue;
                }
                self.truncate_from(id.index);
            }

            self.size_bytes += size_bytes(entry);
            self.entries.push(entry.clone());
            modified = true;
        }
        Ok(modified)
    }

    // Returns the total size in bytes of all stored payloads. This is an
    // approximation of the total memory occupied by this instance.
    pub fn size_bytes(&self) -> i64 {
        self.size_bytes
    }

    // Returns up to "limit" entries strictly after the supplied id, stopping
    // before the payloads add up to more than "max_bytes". The first entry is
    // always included so that oversized entries still make progress. Must only
    // be called if the supplied index is not compacted beyond "previous_id".
    pub fn get_entries_after(&self, index: i64, limit: usize, max_bytes: i64) -> Vec<Entry> {
        assert!(index >= self.previous_id.index);

        let start = self.local_index(index + 1);
        if start >= self.entries.len() {
            return Vec::new();
        }

        let mut total = 0;
        let mut result = Vec::new();
        for entry in self.entries[start..].iter().take(limit) {
            total += size_bytes(entry);
            if !result.is_empty() && total > max_bytes {
                break;
            }
            result.push(entry.clone());
        }
        result
    }

    // Returns the entry id for the entry at the supplied index. Must only be
    // called if the index is known to this slice.
    //
    // Note that for the entry immediately before the start of this slice, the
    // entry id can be returned, but not the full entry.
    pub fn id_at(&self, index: i64) -> EntryId {
        if index == self.previous_id.index {
            return self.previous_id.clone();
        }
        let local_idx = self.local_index(index);
        self.entries[local_idx].id.clone().expect("id")
    }

    // Returns the entry at the supplied index. Must only be called if the index
    // is present in the slice.
    pub fn entry_at(&self, index: i64) -> &Entry {
        let local_idx = self.local_index(index);
        &self.entries[local_idx]
    }

    pub fn entries(&self) -> &Vec<Entry> {
        &self.entries
    }

    // Removes all entries up to and including the supplied id. Once this
    // returns, this instance starts immediately after the supplied id.
    pub fn prune_until(&mut self, entry_id: &EntryId) {
        assert!(
            entry_id.index >= self.previous_id.index,
            "Cannot prune into the past"
        );

        if self.contains(entry_id) {
            let end = self.local_index(entry_id.index) + 1;
            for entry in self.entries.drain(0..end) {
                self.size_bytes -= size_bytes(&entry);
            }
        } else {
            // Entry is not present (or has the wrong term), nothing after it
            // can be trusted.
            self.entries.clear();
            self.size_bytes = 0;
        }
        self.previous_id = entry_id.clone();
    }

    // Drops the entry at the supplied index and everything after it.
    fn truncate_from(&mut self, index: i64) {
        let start = self.local_index(index);
        for entry in self.entries.drain(start..) {
            self.size_bytes -= size_bytes(&entry);
        }
    }

    // Returns the position in the slice vector associated with the supplied
    // log index. Must only be called if the index is known to be within range
    // of this slice.
    fn local_index(&self, index: i64) -> usize {
        let previous = self.previous_id.index;
        let adjusted = index - previous - 1;
        assert!(
            adjusted >= 0,
            "adjusted index out of range: adjusted={}, index={}, previous={}",
            adjusted,
            index,
            previous
        );
        adjusted as usize
    }
}

fn entry_id(entry: &Entry) -> RaftResult<&EntryId> {
    entry
        .id
        .as_ref()
        .ok_or_else(|| RaftError::missing("entry.id"))
}

fn size_bytes(entry: &Entry) -> i64 {
    match &entry.data {
        Some(Payload(bytes)) => bytes.len() as i64,
        Some(Config(_)) | Some(Noop(_)) | None => 0,
    }
}
