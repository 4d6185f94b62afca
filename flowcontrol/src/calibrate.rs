//! Cost calibration: derives per-message-code cost tables from a synthetic
//! benchmark.
//!
//! For every registered request shape the calibrator runs randomized
//! benchmark passes through an in-process pipe driving the real
//! request-handling path, records the average serving time and the largest
//! message seen in each direction, and persists the samples. Costs are then
//! derived as an upper bound: twice the trimmed mean of the recorded
//! serving times, lifted by the bandwidth cost of the largest observed
//! messages. Message classes bundling a variable number of items get a
//! linear `(base, per-item)` model fitted between their single-item and
//! full-bundle shapes.

use crate::costs::{RequestCostEntry, RequestCostList};
use lumen_runtime::{mocks, Clock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, thread, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Key prefix of persisted benchmark samples; the class id is appended.
pub const SAMPLE_KEY_PREFIX: &[u8] = b"_requestBenchmarks3_";

#[derive(Error, Debug)]
pub enum Error {
    #[error("benchmark setup failed: {0}")]
    Setup(String),
    #[error(transparent)]
    Pipe(#[from] lumen_runtime::Error),
    #[error("unknown benchmark class: {0}")]
    UnknownClass(String),
    #[error("invalid cost mapping for message code {0}")]
    InvalidMapping(u64),
    #[error("benchmark worker panicked")]
    WorkerPanicked,
}

/// Key-value storage for benchmark samples, so calibration survives
/// restarts while the chain state it was measured against is still fresh.
pub trait SampleStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&mut self, key: &[u8], value: &[u8]);
}

/// One persisted benchmark observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub block_number: u64,
    /// Average serving time in nanoseconds, scaled by the serving thread
    /// count.
    pub avg_time: u64,
    pub max_in_size: u32,
    pub max_out_size: u32,
}

/// A sink wrapper recording the largest message sent through it.
pub struct MeteredSink {
    inner: mocks::Sink,
    max_size: u32,
}

impl MeteredSink {
    fn new(inner: mocks::Sink) -> Self {
        Self { inner, max_size: 0 }
    }

    pub fn send(&mut self, msg: bytes::Bytes) -> Result<(), lumen_runtime::Error> {
        self.max_size = self.max_size.max(msg.len().min(u32::MAX as usize) as u32);
        self.inner.send(msg)
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }
}

/// A synthetic request shape representative of one benchmark class.
pub trait RequestShape: Send {
    /// Prepare `count` requests worth of input.
    fn init(&mut self, count: usize) -> Result<(), Error>;
    /// Send the request at `index` down the client side of the pipe.
    fn request(&mut self, pipe: &mut MeteredSink, index: usize) -> Result<(), Error>;
}

/// The serving side of the benchmark: reads one request from the stream
/// and writes its replies through the (metered) sink, exercising the real
/// request-handling path.
pub trait Handler: Send {
    fn handle(
        &mut self,
        stream: &mut mocks::Stream,
        sink: &mut MeteredSink,
    ) -> Result<(), Error>;
}

/// One benchmark class: a request shape plus cost-correction knobs for
/// classes whose benchmark conditions are known to flatter them.
pub struct ShapeClass {
    pub id: &'static str,
    pub name: &'static str,
    /// Added to the observed maximum reply size.
    pub out_size_corr: u32,
    /// Multiplier on the trimmed-mean serving time; zero means none.
    pub avg_time_corr: f64,
    #[allow(clippy::type_complexity)]
    pub make: Box<dyn Fn() -> Box<dyn RequestShape> + Send + Sync>,
}

/// Maps one wire message code onto benchmark classes. `single` classes
/// bound the cost of a one-item request; `bulk` classes, when present,
/// bound a request bundling `max_count` items.
pub struct CodeMapping {
    pub msg_code: u64,
    pub single: Vec<&'static str>,
    pub bulk: Vec<&'static str>,
    pub max_count: u64,
}

pub struct Config {
    /// Randomized benchmark passes per run.
    pub pass_count: usize,
    /// Request count of the first measurement of each class; later
    /// measurements scale toward the per-class time target.
    pub first_count: usize,
    /// Wall-clock budget of a whole benchmark run.
    pub total_time: Duration,
    /// Samples older than this many blocks are discarded.
    pub discard_age: u64,
    /// Re-run when the youngest sample is older than this many blocks.
    pub rerun_age: u64,
    /// Re-run when fewer samples than this remain.
    pub rerun_count: usize,
    /// Serving thread count the recorded times are scaled by.
    pub thread_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pass_count: 10,
            first_count: 50,
            total_time: Duration::from_secs(20),
            discard_age: 100_000,
            rerun_age: 10_000,
            rerun_count: 5,
            thread_count: 1,
        }
    }
}

struct Setup {
    class: usize,
    shape: Box<dyn RequestShape>,
    total_count: usize,
    total_time: Duration,
    max_in_size: u32,
    max_out_size: u32,
    err: Option<Error>,
}

/// Runs the benchmark and turns its samples into request cost tables.
pub struct Calibrator<C: Clock> {
    classes: Vec<ShapeClass>,
    mapping: Vec<CodeMapping>,
    config: Config,
    clock: C,
}

impl<C: Clock> Calibrator<C> {
    pub fn new(
        classes: Vec<ShapeClass>,
        mapping: Vec<CodeMapping>,
        config: Config,
        clock: C,
    ) -> Result<Self, Error> {
        for m in &mapping {
            for id in m.single.iter().chain(&m.bulk) {
                if !classes.iter().any(|class| class.id == *id) {
                    return Err(Error::UnknownClass((*id).to_string()));
                }
            }
            if !m.bulk.is_empty() && m.max_count < 2 {
                return Err(Error::InvalidMapping(m.msg_code));
            }
        }
        Ok(Self {
            classes,
            mapping,
            config,
            clock,
        })
    }

    /// Produce the cost list announced to clients and the minimum buffer
    /// limit clients need to be able to send any bundled request
    /// (twice the largest bundle cost).
    ///
    /// Persisted samples measured within `discard_age` blocks of `head` are
    /// reused; the benchmark itself only runs when too few remain or the
    /// youngest has aged past `rerun_age`. A class whose measurement fails
    /// keeps its previous samples.
    pub fn benchmark_costs<S: SampleStore, H: Handler>(
        &self,
        store: &mut S,
        handler: &mut H,
        head: u64,
        in_size_cost_factor: f64,
        out_size_cost_factor: f64,
    ) -> Result<(RequestCostList, u64), Error> {
        let mut all: Vec<Vec<Sample>> = Vec::with_capacity(self.classes.len());
        let mut rerun = false;
        for class in &self.classes {
            let mut data: Vec<Sample> = store
                .get(&sample_key(class.id))
                .and_then(|enc| bincode::deserialize(&enc).ok())
                .unwrap_or_default();
            data.retain(|s| s.block_number + self.config.discard_age > head);
            if data.len() < self.config.rerun_count
                || data
                    .last()
                    .is_some_and(|s| s.block_number + self.config.rerun_age <= head)
            {
                rerun = true;
            }
            all.push(data);
        }

        if rerun {
            for setup in self.run(handler) {
                if setup.err.is_some() || setup.total_count == 0 {
                    continue;
                }
                let avg_time = setup.total_time.as_nanos() as u64 / setup.total_count as u64;
                let data = &mut all[setup.class];
                data.push(Sample {
                    block_number: head,
                    avg_time: avg_time * self.config.thread_count as u64,
                    max_in_size: setup.max_in_size,
                    max_out_size: setup.max_out_size,
                });
                if let Ok(enc) = bincode::serialize(data) {
                    store.put(&sample_key(self.classes[setup.class].id), &enc);
                }
            }
        }

        let costs: HashMap<&str, u64> = self
            .classes
            .iter()
            .zip(&all)
            .map(|(class, data)| {
                (
                    class.id,
                    data_to_cost(class, data, in_size_cost_factor, out_size_cost_factor),
                )
            })
            .collect();
        let max_of = |ids: &[&'static str]| -> Result<u64, Error> {
            let mut max = 0u64;
            for id in ids {
                max = max.max(
                    *costs
                        .get(id)
                        .ok_or_else(|| Error::UnknownClass((*id).to_string()))?,
                );
            }
            Ok(max)
        };

        let mut max_all_costs = 0u64;
        let mut list = Vec::with_capacity(self.mapping.len());
        for m in &self.mapping {
            let cost = max_of(&m.single)?;
            if m.bulk.is_empty() {
                list.push(RequestCostEntry {
                    msg_code: m.msg_code,
                    base_cost: 0,
                    req_cost: cost,
                });
                continue;
            }
            let bulk_cost = max_of(&m.bulk)?.max(cost);
            max_all_costs = max_all_costs.max(bulk_cost);
            let mut dc = (bulk_cost - cost) / (m.max_count - 1);
            let mut base = cost;
            // Keep the per-item cost below the single-item cost so a
            // one-item request never prices above its own class
            if base < dc {
                dc = bulk_cost / m.max_count;
                base = dc;
            }
            list.push(RequestCostEntry {
                msg_code: m.msg_code,
                base_cost: base - dc,
                req_cost: dc,
            });
        }
        Ok((RequestCostList(list), max_all_costs * 2))
    }

    fn run<H: Handler>(&self, handler: &mut H) -> Vec<Setup> {
        info!("running request cost benchmark");
        let mut setups: Vec<Setup> = self
            .classes
            .iter()
            .enumerate()
            .map(|(class, shape_class)| Setup {
                class,
                shape: (shape_class.make)(),
                total_count: 0,
                total_time: Duration::ZERO,
                max_in_size: 0,
                max_out_size: 0,
                err: None,
            })
            .collect();
        let target = self.config.total_time
            / (self.classes.len() * self.config.pass_count).max(1) as u32;

        let mut rng = rand::thread_rng();
        let mut order: Vec<usize> = (0..setups.len()).collect();
        for pass in 0..self.config.pass_count {
            order.shuffle(&mut rng);
            for &i in &order {
                let setup = &mut setups[i];
                if setup.err.is_some() {
                    continue;
                }
                let mut count = self.config.first_count;
                if !setup.total_time.is_zero() {
                    count = ((setup.total_count as u128 * target.as_nanos())
                        / setup.total_time.as_nanos())
                    .max(1)
                    .min(usize::MAX as u128) as usize;
                }
                if let Err(err) = self.measure(setup, handler, count) {
                    warn!(
                        name = self.classes[setup.class].name,
                        error = %err,
                        "benchmark measurement failed"
                    );
                    setup.err = Some(err);
                }
            }
            debug!(
                percent = (pass + 1) * 100 / self.config.pass_count.max(1),
                "benchmark progress"
            );
        }

        for setup in &setups {
            if setup.err.is_none() && setup.total_count > 0 {
                debug!(
                    name = self.classes[setup.class].name,
                    count = setup.total_count,
                    avg_nanos = setup.total_time.as_nanos() as u64 / setup.total_count as u64,
                    max_in = setup.max_in_size,
                    max_out = setup.max_out_size,
                    "benchmark result"
                );
            }
        }
        setups
    }

    /// Run `count` requests of one shape through a fresh pipe, concurrently
    /// sending, serving and draining replies the way live traffic flows.
    fn measure<H: Handler>(
        &self,
        setup: &mut Setup,
        handler: &mut H,
        count: usize,
    ) -> Result<(), Error> {
        setup.shape.init(count)?;

        let ((client_sink, mut client_stream), (server_sink, mut server_stream)) =
            mocks::duplex();
        let mut client_sink = MeteredSink::new(client_sink);
        let mut server_sink = MeteredSink::new(server_sink);
        let shape = setup.shape.as_mut();

        let start = self.clock.now();
        let (sent, served, drained) = thread::scope(|s| {
            let sender = s.spawn(move || -> Result<u32, Error> {
                for index in 0..count {
                    shape.request(&mut client_sink, index)?;
                }
                Ok(client_sink.max_size())
            });
            let server = s.spawn(move || -> Result<u32, Error> {
                for _ in 0..count {
                    handler.handle(&mut server_stream, &mut server_sink)?;
                }
                Ok(server_sink.max_size())
            });
            // A failing worker drops its sink, which unblocks the others,
            // so the scope always terminates
            let mut drained: Result<(), Error> = Ok(());
            for _ in 0..count {
                if let Err(err) = client_stream.recv() {
                    drained = Err(err.into());
                    break;
                }
            }
            (sender.join(), server.join(), drained)
        });
        let max_in_size = sent.map_err(|_| Error::WorkerPanicked)??;
        let max_out_size = served.map_err(|_| Error::WorkerPanicked)??;
        drained?;

        setup.total_time += self.clock.now().saturating_since(start);
        setup.total_count += count;
        setup.max_in_size = setup.max_in_size.max(max_in_size);
        setup.max_out_size = setup.max_out_size.max(max_out_size);
        Ok(())
    }
}

fn sample_key(id: &str) -> Vec<u8> {
    let mut key = SAMPLE_KEY_PREFIX.to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

/// Upper cost estimate of one class: twice the trimmed mean (top and bottom
/// quintile dropped) of the recorded serving times, lifted by the bandwidth
/// cost of the largest observed messages.
fn data_to_cost(
    class: &ShapeClass,
    data: &[Sample],
    in_size_cost_factor: f64,
    out_size_cost_factor: f64,
) -> u64 {
    let mut max_in_size: u32 = 0;
    let mut max_out_size: u32 = 0;
    for sample in data {
        max_in_size = max_in_size.max(sample.max_in_size);
        max_out_size = max_out_size.max(sample.max_out_size);
    }

    let mut cost = 0u64;
    if !data.is_empty() {
        let mut times: Vec<u64> = data.iter().map(|s| s.avg_time).collect();
        times.sort_unstable();
        let skip = times.len() / 5;
        let kept = &times[skip..times.len() - skip];
        let mut avg_time = kept.iter().sum::<u64>() / kept.len() as u64;
        max_out_size += class.out_size_corr;
        if class.avg_time_corr != 0.0 {
            avg_time = (avg_time as f64 * class.avg_time_corr) as u64;
        }
        cost = avg_time * 2;
    }
    let in_size_cost = (max_in_size as f64 * in_size_cost_factor * 1.25) as u64;
    let out_size_cost = (max_out_size as f64 * out_size_cost_factor * 1.25) as u64;
    cost.max(in_size_cost).max(out_size_cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use lumen_runtime::deterministic;

    fn class(id: &'static str, payload: usize) -> ShapeClass {
        ShapeClass {
            id,
            name: id,
            out_size_corr: 0,
            avg_time_corr: 0.0,
            make: Box::new(move || Box::new(FixedShape { payload })),
        }
    }

    struct FixedShape {
        payload: usize,
    }

    impl RequestShape for FixedShape {
        fn init(&mut self, _count: usize) -> Result<(), Error> {
            Ok(())
        }

        fn request(&mut self, pipe: &mut MeteredSink, _index: usize) -> Result<(), Error> {
            pipe.send(Bytes::from(vec![0u8; self.payload]))?;
            Ok(())
        }
    }

    struct FailingShape;

    impl RequestShape for FailingShape {
        fn init(&mut self, _count: usize) -> Result<(), Error> {
            Err(Error::Setup("no data to sample".into()))
        }

        fn request(&mut self, _pipe: &mut MeteredSink, _index: usize) -> Result<(), Error> {
            unreachable!()
        }
    }

    /// Echoes a fixed-size reply per request and counts served messages.
    struct EchoHandler {
        reply: usize,
        handled: usize,
    }

    impl Handler for EchoHandler {
        fn handle(
            &mut self,
            stream: &mut mocks::Stream,
            sink: &mut MeteredSink,
        ) -> Result<(), Error> {
            stream.recv()?;
            sink.send(Bytes::from(vec![0u8; self.reply]))?;
            self.handled += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemStore(HashMap<Vec<u8>, Vec<u8>>);

    impl SampleStore for MemStore {
        fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
            self.0.get(key).cloned()
        }

        fn put(&mut self, key: &[u8], value: &[u8]) {
            self.0.insert(key.to_vec(), value.to_vec());
        }
    }

    fn sample(block_number: u64, avg_time: u64) -> Sample {
        Sample {
            block_number,
            avg_time,
            max_in_size: 0,
            max_out_size: 0,
        }
    }

    fn test_config() -> Config {
        Config {
            pass_count: 2,
            first_count: 4,
            total_time: Duration::from_millis(100),
            rerun_count: 1,
            thread_count: 1,
            ..Config::default()
        }
    }

    #[test]
    fn test_data_to_cost_trimmed_mean() {
        let class = class("x", 0);
        let data: Vec<Sample> = [10, 20, 30, 40, 50]
            .iter()
            .map(|avg| sample(0, *avg))
            .collect();
        // Top and bottom quintile dropped: mean(20, 30, 40) * 2
        assert_eq!(data_to_cost(&class, &data, 0.0, 0.0), 60);
    }

    #[test]
    fn test_data_to_cost_size_lift() {
        let mut class = class("x", 0);
        let data = vec![Sample {
            block_number: 0,
            avg_time: 10,
            max_in_size: 1000,
            max_out_size: 200,
        }];
        // avg * 2 = 20 is dominated by the input size cost 1000 * 2 * 1.25
        assert_eq!(data_to_cost(&class, &data, 2.0, 0.0), 2500);

        // The output correction is added before the factor applies
        class.out_size_corr = 300;
        assert_eq!(data_to_cost(&class, &data, 0.0, 2.0), 1250);

        class.avg_time_corr = 3.0;
        assert_eq!(data_to_cost(&class, &data, 0.0, 0.0), 60);
    }

    #[test]
    fn test_empty_data_costs_nothing() {
        let class = class("x", 0);
        assert_eq!(data_to_cost(&class, &[], 1.0, 1.0), 0);
    }

    #[test]
    fn test_benchmark_costs_end_to_end() {
        let clock = deterministic::Clock::new();
        let calibrator = Calibrator::new(
            vec![class("small", 100), class("big", 400)],
            vec![
                CodeMapping {
                    msg_code: 5,
                    single: vec!["small"],
                    bulk: vec!["big"],
                    max_count: 5,
                },
                CodeMapping {
                    msg_code: 6,
                    single: vec!["small"],
                    bulk: vec![],
                    max_count: 1,
                },
            ],
            test_config(),
            clock,
        )
        .unwrap();

        let mut store = MemStore::default();
        let mut handler = EchoHandler {
            reply: 64,
            handled: 0,
        };
        let (list, min_buf_limit) = calibrator
            .benchmark_costs(&mut store, &mut handler, 1000, 1.0, 0.0)
            .unwrap();

        // Each class served first_count requests in each of the two passes
        assert_eq!(handler.handled, 16);

        // small: max_in 100 * 1.25 = 125; big: 400 * 1.25 = 500
        // dc = (500 - 125) / 4 = 93
        assert_eq!(
            list.0[0],
            RequestCostEntry {
                msg_code: 5,
                base_cost: 32,
                req_cost: 93,
            }
        );
        assert_eq!(
            list.0[1],
            RequestCostEntry {
                msg_code: 6,
                base_cost: 0,
                req_cost: 125,
            }
        );
        assert_eq!(min_buf_limit, 1000);

        // Samples were persisted under the prefixed class keys
        let stored: Vec<Sample> =
            bincode::deserialize(&store.get(&sample_key("small")).unwrap()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].block_number, 1000);
        assert_eq!(stored[0].max_in_size, 100);
        assert_eq!(stored[0].max_out_size, 64);
    }

    #[test]
    fn test_fresh_samples_skip_rerun() {
        let clock = deterministic::Clock::new();
        let calibrator = Calibrator::new(
            vec![class("small", 100)],
            vec![CodeMapping {
                msg_code: 1,
                single: vec!["small"],
                bulk: vec![],
                max_count: 1,
            }],
            test_config(),
            clock,
        )
        .unwrap();

        let mut store = MemStore::default();
        let mut handler = EchoHandler {
            reply: 64,
            handled: 0,
        };
        calibrator
            .benchmark_costs(&mut store, &mut handler, 1000, 1.0, 0.0)
            .unwrap();
        let after_first = handler.handled;

        // Enough fresh samples: the previous set stays authoritative
        calibrator
            .benchmark_costs(&mut store, &mut handler, 1001, 1.0, 0.0)
            .unwrap();
        assert_eq!(handler.handled, after_first);

        // Aged past rerun_age: the benchmark runs again
        calibrator
            .benchmark_costs(&mut store, &mut handler, 1000 + 10_000, 1.0, 0.0)
            .unwrap();
        assert!(handler.handled > after_first);
    }

    #[test]
    fn test_stale_samples_discarded() {
        let clock = deterministic::Clock::new();
        let calibrator = Calibrator::new(
            vec![class("small", 100)],
            vec![CodeMapping {
                msg_code: 1,
                single: vec!["small"],
                bulk: vec![],
                max_count: 1,
            }],
            test_config(),
            clock,
        )
        .unwrap();

        // Seed a sample that is past discard_age at the current head
        let mut store = MemStore::default();
        let seeded = vec![Sample {
            block_number: 0,
            avg_time: 77,
            max_in_size: 9999,
            max_out_size: 0,
        }];
        store.put(&sample_key("small"), &bincode::serialize(&seeded).unwrap());

        let mut handler = EchoHandler {
            reply: 64,
            handled: 0,
        };
        let (list, _) = calibrator
            .benchmark_costs(&mut store, &mut handler, 100_000, 1.0, 0.0)
            .unwrap();

        // The stale 9999-byte observation no longer influences the cost
        assert_eq!(list.0[0].req_cost, 125);
        let stored: Vec<Sample> =
            bincode::deserialize(&store.get(&sample_key("small")).unwrap()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].block_number, 100_000);
    }

    #[test]
    fn test_failed_class_keeps_previous_samples() {
        let clock = deterministic::Clock::new();
        let calibrator = Calibrator::new(
            vec![
                class("good", 100),
                ShapeClass {
                    id: "bad",
                    name: "bad",
                    out_size_corr: 0,
                    avg_time_corr: 0.0,
                    make: Box::new(|| Box::new(FailingShape)),
                },
            ],
            vec![CodeMapping {
                msg_code: 1,
                single: vec!["good", "bad"],
                bulk: vec![],
                max_count: 1,
            }],
            test_config(),
            clock,
        )
        .unwrap();

        let mut store = MemStore::default();
        let mut handler = EchoHandler {
            reply: 64,
            handled: 0,
        };
        let (list, _) = calibrator
            .benchmark_costs(&mut store, &mut handler, 1000, 1.0, 0.0)
            .unwrap();

        // The failing class contributed nothing and persisted nothing
        assert_eq!(list.0[0].req_cost, 125);
        assert!(store.get(&sample_key("bad")).is_none());
        assert!(store.get(&sample_key("good")).is_some());
    }

    #[test]
    fn test_new_rejects_unknown_class_and_bad_mapping() {
        let clock = deterministic::Clock::new();
        assert!(matches!(
            Calibrator::new(
                vec![class("a", 1)],
                vec![CodeMapping {
                    msg_code: 1,
                    single: vec!["missing"],
                    bulk: vec![],
                    max_count: 1,
                }],
                Config::default(),
                clock.clone(),
            ),
            Err(Error::UnknownClass(_))
        ));
        assert!(matches!(
            Calibrator::new(
                vec![class("a", 1)],
                vec![CodeMapping {
                    msg_code: 2,
                    single: vec!["a"],
                    bulk: vec!["a"],
                    max_count: 1,
                }],
                Config::default(),
                clock,
            ),
            Err(Error::InvalidMapping(2))
        ));
    }
}
