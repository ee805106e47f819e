use std::collections::{HashSet, VecDeque};
use crate::Bitfield;

// Tracks which pieces still need downloading and who is downloading them.
// Shared by every session behind one lock, so each method is atomic.
#[derive(Debug)]
pub struct PieceTable {

    // Pieces verified present on disk.
    own: Bitfield,

    // Pieces nobody is downloading yet, in index order except for released pieces.
    pending: VecDeque<usize>,

    // Pieces held by exactly one session.
    reserved: HashSet<usize>,

}

impl PieceTable {

    pub fn new(own: Bitfield) -> Self {
        let pending = own.iter_zeros().collect();
        Self {
            own,
            pending,
            reserved: HashSet::new(),
        }
    }

    // Takes the first pending piece the remote has.
    pub fn reserve(&mut self, remote: &Bitfield) -> Option<usize> {
        let pos = self.pending
            .iter()
            .position(|&idx| remote.get(idx).map_or(false, |b| *b))?;
        let idx = self.pending.remove(pos)?;
        self.reserved.insert(idx);
        tracing::trace!("reserved piece {}", idx);
        Some(idx)
    }

    // Returns an unfinished piece, it is picked before any other.
    pub fn release(&mut self, idx: usize) {
        if self.reserved.remove(&idx) {
            tracing::trace!("released piece {}", idx);
            self.pending.push_front(idx);
        }
    }

    // Marks a verified piece as present, returns false if it already was.
    pub fn commit(&mut self, idx: usize) -> bool {
        if idx >= self.own.len() || self.own[idx] {
            return false;
        }
        self.reserved.remove(&idx);
        self.pending.retain(|&i| i != idx);
        self.own.set(idx, true);
        true
    }

    pub fn own(&self) -> &Bitfield { &self.own }

    pub fn is_reserved(&self, idx: usize) -> bool { self.reserved.contains(&idx) }

    pub fn num_have(&self) -> usize { self.own.count_ones() }

    pub fn num_pieces(&self) -> usize { self.own.len() }

    // Pieces not yet verified, reserved or not.
    pub fn num_missing(&self) -> usize { self.pending.len() + self.reserved.len() }

    pub fn is_complete(&self) -> bool { self.own.all() }

    // Whether the remote has anything we still need.
    pub fn wants(&self, remote: &Bitfield) -> bool {
        self.own
            .iter_zeros()
            .any(|idx| remote.get(idx).map_or(false, |b| *b))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use super::*;

    fn bf(bits: &[bool]) -> Bitfield {
        bits.iter().copied().collect()
    }

    #[test]
    fn test_reserve_respects_remote() {
        let mut table = PieceTable::new(bf(&[true, false, false, false]));
        assert_eq!(table.num_missing(), 3);

        let remote = bf(&[true, false, true, true]);
        assert_eq!(table.reserve(&remote), Some(2));
        assert_eq!(table.reserve(&remote), Some(3));
        assert_eq!(table.reserve(&remote), None);
        assert!(table.is_reserved(2));
        assert_eq!(table.num_missing(), 3);
    }

    #[test]
    fn test_release_and_commit() {
        let mut table = PieceTable::new(Bitfield::repeat(false, 3));
        let remote = Bitfield::repeat(true, 3);

        assert_eq!(table.reserve(&remote), Some(0));
        assert_eq!(table.reserve(&remote), Some(1));
        table.release(1);
        // Released pieces go to the front.
        assert_eq!(table.reserve(&remote), Some(1));

        assert!(table.commit(0));
        assert!(!table.commit(0));
        assert!(table.commit(1));
        assert!(!table.is_complete());
        assert!(table.wants(&remote));

        // Releasing something never reserved does nothing.
        table.release(2);
        assert_eq!(table.num_missing(), 1);
        assert!(table.commit(2));
        assert!(table.is_complete());
        assert_eq!(table.reserve(&remote), None);
        assert!(!table.wants(&remote));
    }

    #[tokio::test]
    async fn test_concurrent_reservations_are_unique() {
        let table = Arc::new(Mutex::new(PieceTable::new(Bitfield::repeat(false, 200))));
        let remote = Arc::new(Bitfield::repeat(true, 200));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let table = table.clone();
            let remote = remote.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                let mut released = false;
                loop {
                    let idx = table.lock().await.reserve(&remote);
                    match idx {
                        Some(idx) => {
                            got.push(idx);
                            // Hand one piece back, it must be taken again exactly once.
                            if !released && idx % 3 == 0 {
                                table.lock().await.release(idx);
                                got.pop();
                                released = true;
                            }
                            tokio::task::yield_now().await;
                        },
                        None => break,
                    }
                }
                got
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<_>>());
    }
}
