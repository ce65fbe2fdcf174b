//! Latency statistics of ps requests, such as median, p95, p99 and max.
//!
//! Every handler records the time spent in microseconds to a local `Histogram`. When one type has
//! collected `frequency` values, its detail is sent to the `HistogramAggregator` through a channel
//! and cleared. The aggregator merges the details and prints the followed types periodically.
//!
//! Percentiles are approximated with buckets instead of sorting. The `u64` range is split into
//! buckets whose boundaries grow by a ratio of 1.5, so about 110 buckets cover all values, small
//! values get narrow buckets and large values get wide ones. A value is counted in its bucket, and
//! a percentile is found by walking the cumulative counts, then interpolated linearly between the
//! boundaries of the bucket it falls into.
//!
//! The bucket of a value is found from its highest `1` bit. The bucket of each bit position is
//! computed once, and since one bit range spans at most two buckets, at most two more comparisons
//! find the exact bucket.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coarsetime::Instant;
use likely_stable::{likely, unlikely};
use log::{error, info};
use parking_lot::Mutex;
use strum::{Display, EnumCount, EnumString, FromRepr};
use tokio::select;
use tokio::sync::mpsc;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

/// Bigger than log(2^64) / log(1.5), which is about 109.4.
const TOTAL_BUCKET: usize = 110;

/// Values of one type collected before the detail is sent to the aggregator.
const DEFAULT_FREQUENCY: u64 = 10000;

/// Seconds between two prints of the aggregator.
const PRINT_INTERVAL_SECONDS: u64 = 30;

/// All histogram types to be recorded.
#[derive(
    Default, Clone, Copy, Debug, PartialEq, Eq, Hash, FromRepr, EnumCount, EnumString, Display,
)]
#[repr(usize)]
pub enum HistogramType {
    #[default]
    None,

    PsCreate,
    PsPull,
    PsPush,
    PsSave,
    PsRestore,
}

impl HistogramType {
    /// Types recorded by ps handlers.
    pub fn ps_types() -> Vec<HistogramType> {
        vec![
            HistogramType::PsCreate,
            HistogramType::PsPull,
            HistogramType::PsPush,
            HistogramType::PsSave,
            HistogramType::PsRestore,
        ]
    }
}

impl From<usize> for HistogramType {
    fn from(value: usize) -> Self {
        HistogramType::from_repr(value).unwrap_or_default()
    }
}

impl From<HistogramType> for usize {
    fn from(x: HistogramType) -> Self {
        x as usize
    }
}

/// Counts of values in geometric buckets, bucket `i` holds values in
/// `[bucket_values[i], bucket_values[i + 1])`, bucket 0 also holds 0.
#[derive(Clone, Debug)]
struct HistogramBucket {
    /// Left boundary of each bucket.
    bucket_values: Vec<u64>,

    /// Last bucket whose left boundary is not bigger than `1 << bit`, for each bit.
    bit_position: Vec<usize>,

    /// Number of values in each bucket.
    buckets: Vec<u64>,
}

impl HistogramBucket {
    fn new() -> Self {
        let mut bucket_values: Vec<u64> = vec![0; TOTAL_BUCKET];

        bucket_values[0] = 1;
        bucket_values[1] = 2;

        for i in 2..TOTAL_BUCKET {
            // Float to int cast saturates at u64::MAX.
            bucket_values[i] = (bucket_values[i - 1] as f64 * 1.5).ceil() as u64;
        }

        let mut bit_position: Vec<usize> = vec![0; 64];

        let mut pos: usize = 0;
        for (bit, x) in bit_position.iter_mut().enumerate() {
            let value = 1u64 << bit;

            while pos + 1 < TOTAL_BUCKET && bucket_values[pos + 1] <= value {
                pos += 1;
            }

            *x = pos;
        }

        Self {
            bucket_values,
            bit_position,
            buckets: vec![0; TOTAL_BUCKET],
        }
    }

    #[inline]
    fn get_index(&self, value: u64) -> usize {
        if value == 0 {
            return 0;
        }

        let mut index = self.bit_position[63 - value.leading_zeros() as usize];

        while index + 1 < TOTAL_BUCKET && self.bucket_values[index + 1] <= value {
            index += 1;
        }

        index
    }

    #[inline]
    fn get_left_boundary(&self, index: usize) -> u64 {
        if index == 0 {
            0
        } else {
            self.bucket_values[index]
        }
    }

    #[inline]
    fn get_right_boundary(&self, index: usize) -> u64 {
        match self.bucket_values.get(index + 1) {
            Some(x) => *x,
            None => u64::MAX,
        }
    }

    /// Approximate percentile `p` of `total` values.
    fn get_percentile(&self, p: f64, total: u64) -> f64 {
        let threshold: f64 = total as f64 * p / 100.0;
        let mut cumulative_sum: f64 = 0.0;

        for (i, v) in self.buckets.iter().enumerate() {
            let number: f64 = *v as f64;

            cumulative_sum += number;

            if cumulative_sum >= threshold && *v != 0 {
                let left_sum = cumulative_sum - number;

                // Position of the percentile inside the bucket.
                let pos = (threshold - left_sum) / number;

                let left = self.get_left_boundary(i) as f64;
                let right = self.get_right_boundary(i) as f64;

                return (left + (right - left) * pos).round();
            }
        }

        0.0
    }

    fn add(&mut self, v: u64) {
        let index = self.get_index(v);
        self.buckets[index] += 1;
    }

    fn merge(&mut self, other: &HistogramBucket) {
        for (x, y) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *x += *y;
        }
    }

    fn clear(&mut self) {
        self.buckets.iter_mut().for_each(|x| *x = 0);
    }
}

/// Statistics of one histogram type.
#[derive(Clone, Debug)]
pub struct HistogramDetail {
    pub histogram_type: HistogramType,

    /// Values collected before the detail is sent to the aggregator.
    pub frequency: u64,

    pub min: u64,

    pub max: u64,

    /// Count of values.
    pub num: u64,

    pub sum: u64,

    pub sum_squares: u64,

    buckets: HistogramBucket,
}

impl HistogramDetail {
    pub fn new(histogram_type: HistogramType) -> Self {
        Self {
            histogram_type,
            frequency: Self::get_frequency(histogram_type),
            min: u64::MAX,
            max: 0,
            num: 0,
            sum: 0,
            sum_squares: 0,
            buckets: HistogramBucket::new(),
        }
    }

    /// Checkpoint and create requests are rare, each of them is sent at once.
    fn get_frequency(histogram_type: HistogramType) -> u64 {
        match histogram_type {
            HistogramType::PsCreate | HistogramType::PsSave | HistogramType::PsRestore => 1,
            _ => DEFAULT_FREQUENCY,
        }
    }

    pub fn clear(&mut self) {
        self.min = u64::MAX;
        self.max = 0;
        self.num = 0;
        self.sum = 0;
        self.sum_squares = 0;

        self.buckets.clear();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    pub fn add(&mut self, v: u64) {
        self.min = self.min.min(v);
        self.max = self.max.max(v);

        self.num += 1;

        // Maybe overflow.
        self.sum = self.sum.wrapping_add(v);
        self.sum_squares = self.sum_squares.wrapping_add(v.wrapping_mul(v));

        self.buckets.add(v);
    }

    pub fn merge(&mut self, other: &HistogramDetail) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);

        self.num = self.num.wrapping_add(other.num);
        self.sum = self.sum.wrapping_add(other.sum);
        self.sum_squares = self.sum_squares.wrapping_add(other.sum_squares);

        self.buckets.merge(&other.buckets);
    }

    pub fn median(&self) -> f64 {
        self.buckets.get_percentile(50.0, self.num)
    }

    pub fn p95(&self) -> f64 {
        self.buckets.get_percentile(95.0, self.num)
    }

    pub fn p99(&self) -> f64 {
        self.buckets.get_percentile(99.0, self.num)
    }

    pub fn average(&self) -> f64 {
        if self.num > 0 {
            self.sum as f64 / self.num as f64
        } else {
            0.0
        }
    }

    pub fn standard_deviation(&self) -> f64 {
        if self.num == 0 {
            return 0.0;
        }

        let average = self.average();
        let variance = self.sum_squares as f64 / self.num as f64 - average * average;

        variance.max(0.0).sqrt()
    }

    #[inline]
    pub fn is_enough_to_send(&self) -> bool {
        self.frequency > 0 && self.num % self.frequency == 0
    }
}

impl fmt::Display for HistogramDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} statistics in microseconds, total: {}, p50: {}, p95: {}, p99: {}, max: {}",
            self.histogram_type,
            self.num,
            self.median(),
            self.p95(),
            self.p99(),
            self.max,
        )
    }
}

fn all_histogram_details() -> Vec<HistogramDetail> {
    (0..HistogramType::COUNT)
        .map(|i| HistogramDetail::new(HistogramType::from(i)))
        .collect()
}

/// Local statistics of all types, sent to the aggregator periodically.
///
/// Without a sender the values are only kept locally.
#[derive(Clone)]
pub struct Histogram {
    details: Vec<HistogramDetail>,

    sender: Option<mpsc::Sender<HistogramDetail>>,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            details: all_histogram_details(),
            sender: None,
        }
    }
}

impl Histogram {
    pub fn new(sender: mpsc::Sender<HistogramDetail>) -> Self {
        Self {
            details: all_histogram_details(),
            sender: Some(sender),
        }
    }

    /// Local detail of one type.
    pub fn detail(&self, histogram_type: HistogramType) -> Option<&HistogramDetail> {
        self.details.get(usize::from(histogram_type))
    }

    fn send_detail(&mut self, index: usize) {
        let sender = match self.sender.as_ref() {
            Some(x) => x,
            None => return,
        };

        let detail = self.details[index].clone();
        self.details[index].clear();

        if let Err(err) = sender.try_send(detail) {
            error!("send histogram detail failed! err: {}", err);
        }
    }

    pub fn add(&mut self, histogram_type: HistogramType, v: u64) {
        let index: usize = histogram_type.into();

        if likely(index < self.details.len()) {
            self.details[index].add(v);

            if self.details[index].is_enough_to_send() {
                self.send_detail(index);
            }
        } else {
            error!(
                "out of range, index: {}, details.len(): {}",
                index,
                self.details.len()
            );
        }
    }
}

/// Add the time spent since `start` to `histogram`.
#[inline]
pub fn record_time(histogram: &mut Histogram, histogram_type: HistogramType, start: Instant) {
    histogram.add(histogram_type, start.elapsed().as_micros());
}

/// Prints the followed types every `interval`.
#[derive(Clone)]
struct PrintHistogram {
    interval: Duration,

    aggregator: Arc<Vec<Mutex<HistogramDetail>>>,

    followed_histogram_indexes: Vec<usize>,
}

impl PrintHistogram {
    async fn run(self, subsys: SubsystemHandle) -> Result<()> {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            select! {
                _ = interval.tick() => {
                    for index in self.followed_histogram_indexes.iter() {
                        if unlikely(*index >= self.aggregator.len()) {
                            continue;
                        }

                        let x = self.aggregator[*index].lock();

                        if !x.is_empty() {
                            info!("{}", x);
                        }
                    }
                },
                _ = subsys.on_shutdown_requested() => {
                    info!("PrintHistogram shutdown!");
                    return Ok(());
                }
            }
        }
    }
}

/// Merge the details sent by all handlers.
pub struct HistogramAggregator {
    receiver: mpsc::Receiver<HistogramDetail>,

    aggregator: Arc<Vec<Mutex<HistogramDetail>>>,

    printer: PrintHistogram,
}

impl HistogramAggregator {
    /// Only the `histogram_types` are printed.
    pub fn new(receiver: mpsc::Receiver<HistogramDetail>, histogram_types: &[HistogramType]) -> Self {
        let aggregator: Arc<Vec<Mutex<HistogramDetail>>> =
            Arc::new(all_histogram_details().into_iter().map(Mutex::new).collect());

        let printer = PrintHistogram {
            interval: Duration::from_secs(PRINT_INTERVAL_SECONDS),
            aggregator: aggregator.clone(),
            followed_histogram_indexes: histogram_types.iter().map(|x| usize::from(*x)).collect(),
        };

        Self {
            receiver,
            aggregator,
            printer,
        }
    }

    /// Merged detail of one type.
    pub fn merged(&self, histogram_type: HistogramType) -> Option<HistogramDetail> {
        self.aggregator
            .get(usize::from(histogram_type))
            .map(|x| x.lock().clone())
    }

    fn update_detail(&self, detail: &HistogramDetail) {
        let index = usize::from(detail.histogram_type);

        match self.aggregator.get(index) {
            Some(x) => x.lock().merge(detail),
            None => {
                error!(
                    "out of range, index: {}, total enum: {}",
                    index,
                    HistogramType::COUNT
                );
            }
        }
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<()> {
        let printer = self.printer.clone();
        subsys.start(SubsystemBuilder::new("print_histogram", |a| printer.run(a)));

        loop {
            select! {
                detail = self.receiver.recv() => {
                    match detail {
                        Some(x) => self.update_detail(&x),
                        None => {
                            // All senders are gone.
                            subsys.on_shutdown_requested().await;
                            info!("HistogramAggregator shutdown!");
                            return Ok(());
                        }
                    }
                },
                _ = subsys.on_shutdown_requested() => {
                    info!("HistogramAggregator shutdown!");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        let bucket = HistogramBucket::new();

        for v in [0u64, 1, 2, 3, 4, 7, 8, 100, 1000, 123456, u32::MAX as u64, u64::MAX] {
            let index = bucket.get_index(v);

            assert!(bucket.get_left_boundary(index) <= v);
            assert!(v < bucket.get_right_boundary(index) || index == TOTAL_BUCKET - 1);
        }
    }

    #[test]
    fn test_percentile() {
        let mut detail = HistogramDetail::new(HistogramType::PsPull);

        for v in 1..=1000u64 {
            detail.add(v);
        }

        assert_eq!(detail.num, 1000);
        assert_eq!(detail.min, 1);
        assert_eq!(detail.max, 1000);
        assert!((detail.average() - 500.5).abs() < 1e-6);

        // Bucket width near 500 and 990 is about a third of the value.
        assert!((detail.median() - 500.0).abs() < 500.0 / 3.0);
        assert!((detail.p99() - 990.0).abs() < 990.0 / 3.0);
        assert!(detail.median() <= detail.p95());
        assert!(detail.p95() <= detail.p99());

        let std = detail.standard_deviation();
        assert!((std - 288.67).abs() < 1.0);
    }

    #[test]
    fn test_merge() {
        let mut a = HistogramDetail::new(HistogramType::PsPush);
        let mut b = HistogramDetail::new(HistogramType::PsPush);

        a.add(10);
        b.add(30);
        b.add(20);

        a.merge(&b);
        assert_eq!(a.num, 3);
        assert_eq!(a.sum, 60);
        assert_eq!(a.min, 10);
        assert_eq!(a.max, 30);

        a.clear();
        assert!(a.is_empty());
        assert_eq!(a.median(), 0.0);
    }

    #[test]
    fn test_histogram_type() {
        assert_eq!(HistogramType::from(usize::from(HistogramType::PsSave)), HistogramType::PsSave);
        assert_eq!(HistogramType::from(1000), HistogramType::None);
        assert_eq!(HistogramType::PsRestore.to_string(), "PsRestore");
        assert_eq!("PsPull".parse::<HistogramType>().ok(), Some(HistogramType::PsPull));
    }

    #[test]
    fn test_send_to_aggregator() {
        let (sender, receiver) = mpsc::channel(16);

        let mut histogram = Histogram::new(sender);
        let mut aggregator = HistogramAggregator::new(receiver, &HistogramType::ps_types());

        // Pull is sent every 10000 values, save at once.
        histogram.add(HistogramType::PsPull, 5);
        histogram.add(HistogramType::PsSave, 1200);
        histogram.add(HistogramType::PsSave, 800);

        let mut received = 0;
        while let Ok(detail) = aggregator.receiver.try_recv() {
            aggregator.update_detail(&detail);
            received += 1;
        }
        assert_eq!(received, 2);

        let save = aggregator.merged(HistogramType::PsSave).unwrap();
        assert_eq!(save.num, 2);
        assert_eq!(save.max, 1200);

        assert!(aggregator.merged(HistogramType::PsPull).unwrap().is_empty());
        assert_eq!(histogram.detail(HistogramType::PsPull).map(|x| x.num), Some(1));
        assert_eq!(histogram.detail(HistogramType::PsSave).map(|x| x.num), Some(0));
    }
}
