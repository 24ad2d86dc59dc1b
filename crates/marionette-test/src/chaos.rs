//! Lossy link between the simulated avatar server and the client
//!
//! Items are scheduled on a delivery heap keyed by arrival time. Jitter alone
//! reorders them; a hold-back step delays some items past their successors
//! on purpose. Seeded, so a test sees the same link on every run.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use marionette_core::UiEventBatch;
use marionette_state::StreamBatch;
use marionette_visual::FaceSample;
use marionette_voice::AudioChunk;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Extra delay on top of the base latency
#[derive(Clone, Copy, Debug)]
pub enum Jitter {
    None,
    /// Evenly spread in `[0, max]`
    Flat { max: Duration },
    /// Pareto tail: mostly near `scale`, occasionally far beyond
    HeavyTail { scale: Duration, alpha: f64, cap: Duration },
}

impl Jitter {
    fn draw(&self, rng: &mut StdRng) -> Duration {
        match *self {
            Jitter::None => Duration::ZERO,
            Jitter::Flat { max } => max.mul_f64(rng.gen::<f64>()),
            Jitter::HeavyTail { scale, alpha, cap } => {
                let u: f64 = rng.gen_range(1e-9..1.0);
                scale.mul_f64(u.powf(-1.0 / alpha)).min(cap)
            }
        }
    }
}

/// How the link misbehaves
#[derive(Clone, Debug)]
pub struct LinkProfile {
    pub latency: Duration,
    pub jitter: Jitter,
    /// Chance an item never arrives
    pub loss: f64,
    /// Chance an item is delivered twice
    pub duplicate: f64,
    /// Chance an item is held back by up to `hold_back_max`
    pub hold_back: f64,
    pub hold_back_max: Duration,
}

impl LinkProfile {
    /// Nothing lost, nothing reordered
    pub fn clean() -> Self {
        LinkProfile {
            latency: Duration::from_millis(20),
            jitter: Jitter::None,
            loss: 0.0,
            duplicate: 0.0,
            hold_back: 0.0,
            hold_back_max: Duration::ZERO,
        }
    }

    /// Home wifi with a busy neighbour
    pub fn congested_wifi() -> Self {
        LinkProfile {
            latency: Duration::from_millis(60),
            jitter: Jitter::HeavyTail {
                scale: Duration::from_millis(30),
                alpha: 1.6,
                cap: Duration::from_millis(800),
            },
            loss: 0.05,
            duplicate: 0.02,
            hold_back: 0.08,
            hold_back_max: Duration::from_millis(150),
        }
    }

    /// Cellular at the edge of coverage
    pub fn weak_cellular() -> Self {
        LinkProfile {
            latency: Duration::from_millis(180),
            jitter: Jitter::HeavyTail {
                scale: Duration::from_millis(80),
                alpha: 1.2,
                cap: Duration::from_secs(2),
            },
            loss: 0.15,
            duplicate: 0.05,
            hold_back: 0.2,
            hold_back_max: Duration::from_millis(400),
        }
    }
}

impl Default for LinkProfile {
    fn default() -> Self {
        LinkProfile::congested_wifi()
    }
}

/// One unit of server stream data
#[derive(Clone, Debug)]
pub enum StreamItem {
    Audio(AudioChunk),
    FaceAuthoritative(FaceSample),
    FaceRealtime(FaceSample),
    Event(UiEventBatch),
}

impl StreamItem {
    pub fn into_batch(self) -> StreamBatch {
        match self {
            StreamItem::Audio(chunk) => StreamBatch::Audio(vec![chunk]),
            StreamItem::FaceAuthoritative(s) => StreamBatch::FaceAuthoritative(vec![s]),
            StreamItem::FaceRealtime(s) => StreamBatch::FaceRealtime(vec![s]),
            StreamItem::Event(batch) => StreamBatch::Event(vec![batch]),
        }
    }
}

/// Counters over the life of a link
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub offered: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub held_back: u64,
    pub worst_delay: Duration,
}

impl LinkStats {
    pub fn drop_ratio(&self) -> f64 {
        match self.offered {
            0 => 0.0,
            n => self.dropped as f64 / n as f64,
        }
    }
}

/// Arrival time, then send order, so equal arrivals keep their order
type Slot = Reverse<(Duration, u64)>;

/// Seeded lossy link carrying items of type `T`
pub struct LossyLink<T> {
    profile: LinkProfile,
    rng: StdRng,
    queue: BinaryHeap<(Slot, usize)>,
    items: Vec<Option<(T, Duration)>>,
    clock: Duration,
    seq: u64,
    stats: LinkStats,
}

impl<T: Clone> LossyLink<T> {
    pub fn new(profile: LinkProfile, seed: u64) -> Self {
        LossyLink {
            profile,
            rng: StdRng::seed_from_u64(seed),
            queue: BinaryHeap::new(),
            items: Vec::new(),
            clock: Duration::ZERO,
            seq: 0,
            stats: LinkStats::default(),
        }
    }

    /// Hand an item to the link at the current link time
    pub fn send(&mut self, item: T) {
        self.stats.offered += 1;
        if self.rng.gen_bool(self.profile.loss) {
            self.stats.dropped += 1;
            return;
        }
        if self.rng.gen_bool(self.profile.duplicate) {
            self.stats.duplicated += 1;
            let delay = self.delay();
            self.schedule(item.clone(), delay);
        }
        let mut delay = self.delay();
        if self.rng.gen_bool(self.profile.hold_back) {
            self.stats.held_back += 1;
            delay += self.profile.hold_back_max.mul_f64(self.rng.gen::<f64>());
        }
        self.schedule(item, delay);
    }

    fn delay(&mut self) -> Duration {
        self.profile.latency + self.profile.jitter.draw(&mut self.rng)
    }

    fn schedule(&mut self, item: T, delay: Duration) {
        let slot = self.items.len();
        self.items.push(Some((item, self.clock)));
        self.queue
            .push((Reverse((self.clock + delay, self.seq)), slot));
        self.seq += 1;
    }

    /// Advance link time by `dt` and return everything that arrived, in
    /// arrival order
    pub fn advance(&mut self, dt: Duration) -> Vec<T> {
        self.clock += dt;
        let mut arrived = Vec::new();
        while let Some((Reverse((at, _)), slot)) = self.queue.peek().copied() {
            if at > self.clock {
                break;
            }
            self.queue.pop();
            if let Some((item, sent)) = self.items[slot].take() {
                self.stats.delivered += 1;
                self.stats.worst_delay = self.stats.worst_delay.max(at - sent);
                arrived.push(item);
            }
        }
        if self.queue.is_empty() {
            self.items.clear();
        }
        arrived
    }

    /// Items sent but not yet arrived
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn elapsed(&self) -> Duration {
        self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<T: Clone>(link: &mut LossyLink<T>, steps: usize) -> Vec<T> {
        (0..steps)
            .flat_map(|_| link.advance(Duration::from_millis(10)))
            .collect()
    }

    #[test]
    fn test_clean_link_preserves_order() {
        let mut link = LossyLink::new(LinkProfile::clean(), 1);
        for i in 0..50u32 {
            link.send(i);
        }
        assert!(link.advance(Duration::from_millis(10)).is_empty());
        assert_eq!(
            link.advance(Duration::from_millis(10)),
            (0..50).collect::<Vec<_>>()
        );
        assert_eq!(link.stats().drop_ratio(), 0.0);
        assert_eq!(link.pending(), 0);
    }

    #[test]
    fn test_weak_cellular_drops_and_reorders() {
        let mut link = LossyLink::new(LinkProfile::weak_cellular(), 12345);
        for i in 0..1000u32 {
            link.send(i);
        }
        let arrived = drain(&mut link, 300);

        let stats = link.stats();
        assert!(stats.drop_ratio() > 0.05);
        assert!(stats.held_back > 0);
        assert_eq!(link.pending(), 0);
        assert_eq!(stats.delivered as usize, arrived.len());
        assert!(arrived.windows(2).any(|w| w[0] > w[1]));
    }

    #[test]
    fn test_seed_fixes_the_link() {
        let run = |seed| {
            let mut link = LossyLink::new(LinkProfile::congested_wifi(), seed);
            for i in 0..200u32 {
                link.send(i);
            }
            drain(&mut link, 200)
        };
        assert_eq!(run(7), run(7));
    }

    #[test]
    fn test_heavy_tail_stretches_past_the_mean() {
        let mut rng = StdRng::seed_from_u64(42);
        let jitter = Jitter::HeavyTail {
            scale: Duration::from_millis(50),
            alpha: 1.5,
            cap: Duration::from_secs(1),
        };
        let draws: Vec<Duration> = (0..1000).map(|_| jitter.draw(&mut rng)).collect();
        let mean = draws.iter().sum::<Duration>() / 1000;
        let worst = draws.iter().copied().max().unwrap_or_default();
        assert!(worst > mean * 2);
        assert!(draws.iter().all(|d| *d >= Duration::from_millis(50)));
    }
}
