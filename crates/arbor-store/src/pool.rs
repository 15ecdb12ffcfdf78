//! Key pool
//!
//! Keys are the first N primes, handed out in ascending order. Once the
//! ordered pool runs dry, released keys come back in release order under a
//! bumped generation.

use std::collections::VecDeque;

use arbor_core::Key;

/// Ordered key pool with FIFO recycling
#[derive(Debug)]
pub struct KeyPool {
    keys: Vec<u64>,
    cursor: usize,
    recycled: VecDeque<(Key, u32)>,
    recycle: bool,
}

impl KeyPool {
    pub fn new(size: usize, recycle: bool) -> Self {
        KeyPool {
            keys: first_primes(size),
            cursor: 0,
            recycled: VecDeque::new(),
            recycle,
        }
    }

    /// Next key and the generation to issue it under
    pub fn next(&mut self) -> Option<(Key, u32)> {
        if let Some(&raw) = self.keys.get(self.cursor) {
            self.cursor += 1;
            return Some((Key::new(raw), 0));
        }
        if self.recycle {
            return self.recycled.pop_front();
        }
        None
    }

    /// Return the most recent draw after a failed allocation
    pub fn unget(&mut self, key: Key, generation: u32) {
        if generation == 0 && self.cursor > 0 && self.keys[self.cursor - 1] == key.0 {
            self.cursor -= 1;
        } else {
            self.recycled.push_front((key, generation));
        }
    }

    /// Make a released key available again under the next generation
    pub fn give_back(&mut self, key: Key, generation: u32) {
        if self.recycle {
            self.recycled.push_back((key, generation.wrapping_add(1)));
        }
    }

    /// Capacity of the ordered pool
    pub fn size(&self) -> usize {
        self.keys.len()
    }

    /// Keys drawn from the ordered pool so far
    pub fn issued(&self) -> usize {
        self.cursor
    }

    /// Keys waiting to be reissued
    pub fn recyclable(&self) -> usize {
        self.recycled.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.keys.len() && (!self.recycle || self.recycled.is_empty())
    }
}

/// First `n` primes by sieve of Eratosthenes
pub fn first_primes(n: usize) -> Vec<u64> {
    if n == 0 {
        return Vec::new();
    }
    // p_n < n (ln n + ln ln n) for n >= 6
    let limit = if n < 6 {
        15
    } else {
        let nf = n as f64;
        (nf * (nf.ln() + nf.ln().ln())).ceil() as usize + 1
    };

    let mut composite = vec![false; limit + 1];
    let mut primes = Vec::with_capacity(n);
    for i in 2..=limit {
        if composite[i] {
            continue;
        }
        primes.push(i as u64);
        if primes.len() == n {
            break;
        }
        let mut j = i * i;
        while j <= limit {
            composite[j] = true;
            j += i;
        }
    }
    primes
}
