use std::collections::{BTreeMap, HashMap};

use experiment_core::entity::{
    AggregateData, AggregateDataType, AggregateResult, AggregatorResult, AggregatorType,
    OptionDistribution, OptionDistributionItem, ScoreDistribution, ScoreDistributionItem,
    TagContentType,
};

/// Number of score buckets kept by the distribution; the rest collapse into `TAIL_BUCKET`.
pub const DISTRIBUTION_TOP_N: usize = 5;
pub const TAIL_BUCKET: &str = "其他";

/// Streaming min / max / sum / count.
#[derive(Clone, Debug, Default)]
pub struct BasicAggregator {
    min: Option<f64>,
    max: Option<f64>,
    sum: f64,
    count: i64,
}

impl BasicAggregator {
    pub fn append(&mut self, score: f64) {
        self.min = Some(self.min.map_or(score, |m| m.min(score)));
        self.max = Some(self.max.map_or(score, |m| m.max(score)));
        self.sum += score;
        self.count += 1;
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    fn results(&self) -> Vec<AggregatorResult> {
        vec![
            AggregatorResult {
                aggregator_type: AggregatorType::Average,
                data: AggregateData::double(self.mean()),
            },
            AggregatorResult {
                aggregator_type: AggregatorType::Sum,
                data: AggregateData::double(self.sum),
            },
            AggregatorResult {
                aggregator_type: AggregatorType::Max,
                data: AggregateData::double(self.max.unwrap_or_default()),
            },
            AggregatorResult {
                aggregator_type: AggregatorType::Min,
                data: AggregateData::double(self.min.unwrap_or_default()),
            },
            AggregatorResult {
                aggregator_type: AggregatorType::Count,
                data: AggregateData::double(self.count as f64),
            },
        ]
    }
}

/// Score histogram bucketed at two decimals.
#[derive(Clone, Debug, Default)]
pub struct DistributionAggregator {
    // Keyed by the score in hundredths so buckets sort numerically.
    counts: BTreeMap<i64, i64>,
    total: i64,
}

impl DistributionAggregator {
    pub fn append(&mut self, score: f64) {
        let bucket = (score * 100.0).round() as i64;
        *self.counts.entry(bucket).or_default() += 1;
        self.total += 1;
    }

    /// Top buckets by count (ties by ascending score), then the tail bucket if anything is left.
    pub fn distribution(&self) -> ScoreDistribution {
        if self.total == 0 {
            return ScoreDistribution::default();
        }
        let mut buckets: Vec<(i64, i64)> = self.counts.iter().map(|(k, v)| (*k, *v)).collect();
        // Stable sort keeps ascending score order among equal counts.
        buckets.sort_by(|a, b| b.1.cmp(&a.1));
        let total = self.total as f64;
        let mut items: Vec<ScoreDistributionItem> = buckets
            .iter()
            .take(DISTRIBUTION_TOP_N)
            .map(|(bucket, count)| ScoreDistributionItem {
                score: format!("{:.2}", *bucket as f64 / 100.0),
                count: *count,
                percentage: *count as f64 / total,
            })
            .collect();
        let kept: i64 = items.iter().map(|i| i.count).sum();
        let tail = self.total - kept;
        if tail > 0 {
            items.push(ScoreDistributionItem {
                score: TAIL_BUCKET.to_string(),
                count: tail,
                percentage: tail as f64 / total,
            });
        }
        ScoreDistribution { items }
    }

    fn results(&self) -> Vec<AggregatorResult> {
        vec![AggregatorResult {
            aggregator_type: AggregatorType::Distribution,
            data: AggregateData {
                data_type: AggregateDataType::ScoreDistribution,
                value: None,
                score_distribution: Some(self.distribution()),
                option_distribution: None,
            },
        }]
    }
}

/// Counts per selected tag value. Every option is kept.
#[derive(Clone, Debug, Default)]
pub struct OptionDistributionAggregator {
    counts: HashMap<i64, i64>,
    total: i64,
}

impl OptionDistributionAggregator {
    pub fn append(&mut self, tag_value_id: i64) {
        *self.counts.entry(tag_value_id).or_default() += 1;
        self.total += 1;
    }

    pub fn distribution(&self) -> OptionDistribution {
        let mut options: Vec<(i64, i64)> = self.counts.iter().map(|(k, v)| (*k, *v)).collect();
        options.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let total = self.total as f64;
        OptionDistribution {
            items: options
                .into_iter()
                .map(|(option, count)| OptionDistributionItem {
                    option: option.to_string(),
                    count,
                    percentage: count as f64 / total,
                })
                .collect(),
        }
    }

    fn results(&self) -> Vec<AggregatorResult> {
        vec![AggregatorResult {
            aggregator_type: AggregatorType::OptionDistribution,
            data: AggregateData {
                data_type: AggregateDataType::OptionDistribution,
                value: None,
                score_distribution: None,
                option_distribution: Some(self.distribution()),
            },
        }]
    }
}

/// The aggregators applied to one field. Every member sees the same input stream.
#[derive(Clone, Debug)]
pub enum AggregatorGroup {
    /// Evaluator scores.
    Score {
        basic: BasicAggregator,
        distribution: DistributionAggregator,
    },
    /// Continuous-number annotations.
    Numeric { basic: BasicAggregator },
    /// Boolean and categorical annotations.
    Options {
        options: OptionDistributionAggregator,
    },
}

impl AggregatorGroup {
    pub fn for_evaluator_scores() -> Self {
        AggregatorGroup::Score {
            basic: BasicAggregator::default(),
            distribution: DistributionAggregator::default(),
        }
    }

    /// `None` for tag types that are not aggregated (free text).
    pub fn for_tag(content_type: TagContentType) -> Option<Self> {
        match content_type {
            TagContentType::ContinuousNumber => Some(AggregatorGroup::Numeric {
                basic: BasicAggregator::default(),
            }),
            TagContentType::Boolean | TagContentType::Categorical => {
                Some(AggregatorGroup::Options {
                    options: OptionDistributionAggregator::default(),
                })
            }
            TagContentType::FreeText => None,
        }
    }

    /// Non-finite scores are dropped.
    pub fn append_score(&mut self, score: f64) {
        if !score.is_finite() {
            return;
        }
        match self {
            AggregatorGroup::Score {
                basic,
                distribution,
            } => {
                basic.append(score);
                distribution.append(score);
            }
            AggregatorGroup::Numeric { basic } => basic.append(score),
            AggregatorGroup::Options { .. } => {}
        }
    }

    pub fn append_option(&mut self, tag_value_id: i64) {
        if let AggregatorGroup::Options { options } = self {
            options.append(tag_value_id);
        }
    }

    pub fn result(&self) -> AggregateResult {
        let aggregator_results = match self {
            AggregatorGroup::Score {
                basic,
                distribution,
            } => {
                let mut results = basic.results();
                results.extend(distribution.results());
                results
            }
            AggregatorGroup::Numeric { basic } => basic.results(),
            AggregatorGroup::Options { options } => options.results(),
        };
        AggregateResult { aggregator_results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[gtest]
    fn test_basic_aggregator() {
        let mut basic = BasicAggregator::default();
        expect_that!(basic.mean(), eq(0.0));
        for score in [0.5, 1.0, 0.0, 2.5] {
            basic.append(score);
        }
        expect_that!(basic.count(), eq(4));
        expect_that!(basic.sum(), eq(4.0));
        expect_that!(basic.min(), some(eq(0.0)));
        expect_that!(basic.max(), some(eq(2.5)));
        expect_that!(basic.mean(), eq(1.0));
    }

    #[gtest]
    fn test_distribution_collapses_tail() {
        let mut dist = DistributionAggregator::default();
        // 7 distinct scores: 0.1 x3, 0.2 x2, 0.3 x2, 0.4, 0.5, 0.6, 0.7
        for score in [0.1, 0.1, 0.1, 0.2, 0.2, 0.3, 0.3, 0.4, 0.5, 0.6, 0.7] {
            dist.append(score);
        }
        let items = dist.distribution().items;
        let labels: Vec<&str> = items.iter().map(|i| i.score.as_str()).collect();
        assert_eq!(labels, vec!["0.10", "0.20", "0.30", "0.40", "0.50", TAIL_BUCKET]);
        expect_that!(items[5].count, eq(2));
        let total_pct: f64 = items.iter().map(|i| i.percentage).sum();
        expect_that!(total_pct, near(1.0, 1e-9));
    }

    #[gtest]
    fn test_distribution_without_tail() {
        let mut dist = DistributionAggregator::default();
        for score in [1.0, 1.0, 0.899] {
            dist.append(score);
        }
        let items = dist.distribution().items;
        expect_that!(items.len(), eq(2));
        assert_eq!(items[0].score, "1.00");
        expect_that!(items[0].count, eq(2));
        assert_eq!(items[1].score, "0.90");
    }

    #[gtest]
    fn test_score_group_output_shape() {
        let mut group = AggregatorGroup::for_evaluator_scores();
        group.append_score(0.4);
        group.append_score(f64::NAN);
        group.append_score(0.8);
        let result = group.result();
        let types: Vec<AggregatorType> = result
            .aggregator_results
            .iter()
            .map(|r| r.aggregator_type)
            .collect();
        assert_eq!(
            types,
            vec![
                AggregatorType::Average,
                AggregatorType::Sum,
                AggregatorType::Max,
                AggregatorType::Min,
                AggregatorType::Count,
                AggregatorType::Distribution,
            ]
        );
        expect_that!(result.average(), some(near(0.6, 1e-9)));
        let count = result
            .aggregator_results
            .iter()
            .find(|r| r.aggregator_type == AggregatorType::Count)
            .and_then(|r| r.data.value);
        expect_that!(count, some(eq(2.0)));
    }

    #[gtest]
    fn test_option_group() {
        let mut group = AggregatorGroup::for_tag(TagContentType::Boolean).unwrap();
        for value in [11, 12, 11, 11] {
            group.append_option(value);
        }
        group.append_score(3.0);
        let result = group.result();
        let options = result.aggregator_results[0]
            .data
            .option_distribution
            .clone()
            .unwrap();
        expect_that!(options.items.len(), eq(2));
        assert_eq!(options.items[0].option, "11");
        expect_that!(options.items[0].percentage, eq(0.75));
        expect_that!(AggregatorGroup::for_tag(TagContentType::FreeText).is_none(), eq(true));
    }
}
