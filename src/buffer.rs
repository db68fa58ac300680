//! # Sample Buffer
//!
//! Bounded, append-only staging area between the decoder and the persistence
//! sink. Reaching capacity never rejects a sample; `append` keeps it and tells
//! the caller to drain.

use crate::sample::Sample;
use std::num::NonZeroUsize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    Ok,
    /// Capacity reached; the caller should drain
    Full,
}

#[derive(Debug)]
pub struct Buffer {
    samples: Vec<Sample>,
    capacity: NonZeroUsize,
}

impl Buffer {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity.get()),
            capacity,
        }
    }

    /// Store a sample, reporting `Full` once capacity is reached
    pub fn append(&mut self, sample: Sample) -> BufferStatus {
        self.samples.push(sample);
        if self.samples.len() >= self.capacity.get() {
            BufferStatus::Full
        } else {
            BufferStatus::Ok
        }
    }

    /// Take every sample appended since the last drain, in append order
    pub fn drain(&mut self) -> Vec<Sample> {
        std::mem::replace(&mut self.samples, Vec::with_capacity(self.capacity.get()))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }
}
