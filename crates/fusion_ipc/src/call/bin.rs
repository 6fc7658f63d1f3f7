//! Call bins: queued one-way calls batched per caller.
//!
//! Frames for one target accumulate until a limit is hit, the target
//! changes, or the bin is flushed explicitly. A flush writes the whole batch
//! into the target's mailbox as one item, preserving send order.

use crossbeam_channel::Sender;

use fusion_core::{FusionError, FusionId, FusionResult};

pub(crate) struct CallBin {
    target: Option<(FusionId, Sender<Vec<u8>>)>,
    bytes: Vec<u8>,
    count: usize,
    max_num: usize,
    max_data: usize,
}

impl CallBin {
    pub(crate) fn new(max_num: usize, max_data: usize) -> Self {
        Self {
            target: None,
            bytes: Vec::new(),
            count: 0,
            max_num,
            max_data,
        }
    }

    /// Queues a frame for `target`, flushing as the limits require.
    pub(crate) fn push(&mut self, target: FusionId, mailbox: &Sender<Vec<u8>>, frame: &[u8]) -> FusionResult<()> {
        let same_target = matches!(&self.target, Some((id, _)) if *id == target);
        if !same_target {
            self.flush()?;
            self.target = Some((target, mailbox.clone()));
        } else if !self.bytes.is_empty() && self.bytes.len() + frame.len() > self.max_data {
            self.flush()?;
        }

        self.bytes.extend_from_slice(frame);
        self.count += 1;

        if self.count >= self.max_num || self.bytes.len() >= self.max_data {
            self.flush()?;
        }
        Ok(())
    }

    /// Sends the queued frames. Returns how many were sent.
    pub(crate) fn flush(&mut self) -> FusionResult<usize> {
        if self.count == 0 {
            return Ok(0);
        }
        let count = std::mem::take(&mut self.count);
        let bytes = std::mem::take(&mut self.bytes);
        let Some((target, mailbox)) = &self.target else {
            return Ok(0);
        };
        tracing::debug!("Flushing call bin: {} frames, {} bytes to {}", count, bytes.len(), target);
        mailbox
            .send(bytes)
            .map_err(|_| FusionError::NoSuchInstance(format!("{target} left, {count} one-way calls lost")))?;
        Ok(count)
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_flush_on_count_limit() {
        let (tx, rx) = unbounded();
        let mut bin = CallBin::new(3, 1024);
        let target = FusionId::MASTER;

        bin.push(target, &tx, b"a").unwrap();
        bin.push(target, &tx, b"b").unwrap();
        assert!(rx.try_recv().is_err());
        bin.push(target, &tx, b"c").unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"abc");
        assert_eq!(bin.queued(), 0);
    }

    #[test]
    fn test_target_change_flushes() {
        let (tx_a, rx_a) = unbounded();
        let (tx_b, rx_b) = unbounded();
        let mut bin = CallBin::new(10, 1024);

        bin.push(FusionId::new(2), &tx_a, b"to-a").unwrap();
        bin.push(FusionId::new(3), &tx_b, b"to-b").unwrap();
        assert_eq!(rx_a.try_recv().unwrap(), b"to-a");
        assert!(rx_b.try_recv().is_err());
        assert_eq!(bin.flush().unwrap(), 1);
        assert_eq!(rx_b.try_recv().unwrap(), b"to-b");
    }

    #[test]
    fn test_data_limit() {
        let (tx, rx) = unbounded();
        let mut bin = CallBin::new(100, 8);
        bin.push(FusionId::MASTER, &tx, b"12345").unwrap();
        bin.push(FusionId::MASTER, &tx, b"6789").unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"12345");
        assert_eq!(bin.queued(), 1);
    }

    #[test]
    fn test_flush_to_departed_target() {
        let (tx, rx) = unbounded();
        let mut bin = CallBin::new(10, 1024);
        bin.push(FusionId::new(4), &tx, b"x").unwrap();
        drop(rx);
        assert!(matches!(bin.flush(), Err(FusionError::NoSuchInstance(_))));
        assert_eq!(bin.queued(), 0);
    }
}
