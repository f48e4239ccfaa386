//! Most recent processed chunks per channel for live display

use emg_core::{default_label, ProcessedChunk};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Per-channel samples and labels as returned to a preview caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePreview {
    /// Concatenated samples of every buffered chunk, oldest first
    pub data: Vec<Vec<f64>>,
    /// Most recent label seen per channel
    pub labels: Vec<String>,
}

impl LivePreview {
    /// No data and placeholder labels for `channel_count` channels
    pub fn empty(channel_count: usize) -> Self {
        LivePreview {
            data: vec![Vec::new(); channel_count],
            labels: (0..channel_count).map(default_label).collect(),
        }
    }
}

struct PreviewChunk {
    samples: Vec<f64>,
    label: String,
}

/// Fixed-capacity ring of chunks per channel behind its own lock
pub struct LivePreviewCache {
    channels: Mutex<Vec<VecDeque<PreviewChunk>>>,
    capacity: usize,
}

impl LivePreviewCache {
    pub fn new(channel_count: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        LivePreviewCache {
            channels: Mutex::new(
                (0..channel_count)
                    .map(|_| VecDeque::with_capacity(capacity))
                    .collect(),
            ),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Vec<VecDeque<PreviewChunk>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a chunk to its channel's ring, evicting the oldest past capacity
    ///
    /// Returns false for a channel index outside the cache.
    pub fn push(&self, chunk: &ProcessedChunk) -> bool {
        let entry = PreviewChunk {
            samples: chunk.samples.clone(),
            label: chunk.label.clone(),
        };

        let mut channels = self.lock();
        match channels.get_mut(chunk.channel) {
            Some(ring) => {
                if ring.len() == self.capacity {
                    ring.pop_front();
                }
                ring.push_back(entry);
                true
            }
            None => false,
        }
    }

    /// Copy out the buffered data of every channel
    pub fn snapshot(&self) -> LivePreview {
        let channels = self.lock();
        let mut data = Vec::with_capacity(channels.len());
        let mut labels = Vec::with_capacity(channels.len());

        for (i, ring) in channels.iter().enumerate() {
            data.push(ring.iter().flat_map(|c| c.samples.iter().copied()).collect());
            labels.push(match ring.back() {
                Some(latest) => latest.label.clone(),
                None => default_label(i),
            });
        }

        LivePreview { data, labels }
    }

    pub fn clear(&self) {
        for ring in self.lock().iter_mut() {
            ring.clear();
        }
    }
}
