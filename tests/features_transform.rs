use std::collections::BTreeMap;

use advisor::{
    add_lag_features, chronological_split, compute_log_returns, latest_feature_rows, train_cut,
    FeatureError, Observation, Panel,
};
use chrono::{Days, NaiveDate};

const ENTITIES: [&str; 3] = ["AAPL", "GOOG", "AMZN"];

fn start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
}

/// Small deterministic generator so property checks cover many shapes.
struct Lcg(u64);

impl Lcg {
    fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) as u32
    }

    fn below(&mut self, n: u32) -> u32 {
        self.next_u32() % n
    }
}

/// Shuffled panel with per-entity prices spaced far apart so every price is
/// attributable to its entity.
fn random_panel(seed: u64, rows: usize) -> Panel {
    let mut rng = Lcg(seed);
    let mut next_day: BTreeMap<&str, u64> = BTreeMap::new();
    let mut observations = Vec::with_capacity(rows);

    for _ in 0..rows {
        let entity_idx = rng.below(ENTITIES.len() as u32) as usize;
        let entity = ENTITIES[entity_idx];
        let day = next_day.entry(entity).or_insert(0);
        let date = start_date() + Days::new(*day);
        *day += 1 + u64::from(rng.below(2));
        let base = 1_000.0 * (entity_idx as f64 + 1.0);
        let price = base + f64::from(rng.below(500)) / 10.0;
        observations.push(Observation::new(entity, date, price));
    }

    for i in (1..observations.len()).rev() {
        let j = rng.below(i as u32 + 1) as usize;
        observations.swap(i, j);
    }
    Panel::new(observations)
}

fn per_entity_sorted(panel: &Panel) -> BTreeMap<String, Vec<&Observation>> {
    let mut groups: BTreeMap<String, Vec<&Observation>> = BTreeMap::new();
    for obs in &panel.observations {
        groups.entry(obs.entity_id.clone()).or_default().push(obs);
    }
    for rows in groups.values_mut() {
        rows.sort_by_key(|obs| obs.date);
    }
    groups
}

#[test]
fn log_returns_preserve_rows_and_order() {
    for seed in 0..20 {
        let panel = random_panel(seed, 40 + seed as usize);
        let out = compute_log_returns(&panel);

        assert_eq!(out.len(), panel.len());
        for (before, after) in panel.observations.iter().zip(&out.observations) {
            assert_eq!(before.entity_id, after.entity_id);
            assert_eq!(before.date, after.date);
            assert_eq!(before.close_price, after.close_price);
        }
    }
}

#[test]
fn lags_never_cross_entities() {
    for seed in 0..20 {
        let panel = add_lag_features(&compute_log_returns(&random_panel(seed, 60)), 3).unwrap();

        for rows in per_entity_sorted(&panel).values() {
            for (pos, obs) in rows.iter().enumerate() {
                for i in 1..=3 {
                    let expected = pos
                        .checked_sub(i)
                        .and_then(|earlier| rows[earlier].log_return);
                    assert_eq!(obs.lag(i), expected, "{} pos={pos} lag_{i}", obs.entity_id);
                }
            }
        }
    }
}

#[test]
fn first_observation_of_each_entity_is_undefined() {
    for seed in 0..20 {
        let panel = add_lag_features(&compute_log_returns(&random_panel(seed, 30)), 4).unwrap();

        for rows in per_entity_sorted(&panel).values() {
            let first = rows[0];
            assert_eq!(first.log_return, None);
            assert!(first.lags.iter().all(Option::is_none));
        }
    }
}

#[test]
fn split_keeps_features_and_labels_aligned() {
    for seed in 0..20 {
        let panel = add_lag_features(&compute_log_returns(&random_panel(seed, 50)), 2).unwrap();
        for ratio in [0.1, 0.5, 0.8, 0.95] {
            let split = chronological_split(&panel, ratio).unwrap();
            assert_eq!(split.train_features.len(), split.train_labels.len());
            assert_eq!(split.test_features.len(), split.test_labels.len());
            assert!(split.train_labels.iter().all(|label| label.is_finite()));
            assert!(split.test_labels.iter().all(|label| label.is_finite()));

            let lookup: BTreeMap<(String, NaiveDate), Option<f64>> = panel
                .observations
                .iter()
                .map(|obs| ((obs.entity_id.clone(), obs.date), obs.log_return))
                .collect();
            for (row, label) in split.train_features.iter().zip(&split.train_labels) {
                assert_eq!(lookup[&(row.entity_id.clone(), row.date)], Some(*label));
            }
        }
    }
}

#[test]
fn split_sizes_follow_floor_of_ratio() {
    for seed in 0..10 {
        let n = 20 + seed as usize * 7;
        let panel = compute_log_returns(&random_panel(seed, n));
        for ratio in [0.2, 0.33, 0.8] {
            let split = chronological_split(&panel, ratio).unwrap();
            let expected_train = (ratio * n as f64).floor() as u64;
            assert_eq!(split.report.train_rows_before_drop, expected_train);
            assert_eq!(split.report.test_rows_before_drop, n as u64 - expected_train);
            assert_eq!(
                split.report.train_rows_before_drop - split.report.train_rows_dropped,
                split.train_labels.len() as u64
            );
            assert_eq!(train_cut(n, ratio) as u64, expected_train);
        }
    }
}

#[test]
fn transformations_are_deterministic() {
    let panel = random_panel(7, 80);

    let a = add_lag_features(&compute_log_returns(&panel), 5).unwrap();
    let b = add_lag_features(&compute_log_returns(&panel), 5).unwrap();
    assert_eq!(a, b);
    for (x, y) in a.observations.iter().zip(&b.observations) {
        assert_eq!(
            x.log_return.map(f64::to_bits),
            y.log_return.map(f64::to_bits)
        );
    }

    assert_eq!(
        chronological_split(&a, 0.7).unwrap(),
        chronological_split(&b, 0.7).unwrap()
    );
}

#[test]
fn hundred_rows_three_entities_split_eighty_twenty() {
    let observations: Vec<Observation> = (0..100u64)
        .map(|i| {
            let mut obs = Observation::new(
                ENTITIES[(i % 3) as usize],
                start_date() + Days::new(i),
                100.0 + i as f64,
            );
            obs.log_return = Some((i as f64 * 0.37).sin() * 0.01);
            obs.lags = vec![Some((i as f64 * 0.11).cos() * 0.01)];
            obs
        })
        .collect();
    let panel = Panel::new(observations);
    assert_eq!(
        panel.latest_date(),
        NaiveDate::from_ymd_opt(2020, 4, 9)
    );

    let split = chronological_split(&panel, 0.8).unwrap();

    assert_eq!(split.report.train_rows_before_drop, 80);
    assert_eq!(split.report.test_rows_before_drop, 20);
    assert_eq!(split.train_features.len(), 80);
    assert_eq!(split.train_labels.len(), 80);
    assert_eq!(split.test_features.len(), 20);
    assert_eq!(split.test_labels.len(), 20);

    let last_train = NaiveDate::from_ymd_opt(2020, 3, 20).unwrap();
    assert!(split.train_features.iter().all(|row| row.date <= last_train));
    assert!(split.test_features.iter().all(|row| row.date > last_train));
    assert!(split
        .train_features
        .windows(2)
        .all(|pair| (&pair[0].entity_id, pair[0].date) <= (&pair[1].entity_id, pair[1].date)));
}

#[test]
fn hundred_rows_with_computed_returns_drop_first_rows() {
    let observations: Vec<Observation> = (0..100u64)
        .map(|i| {
            Observation::new(
                ENTITIES[(i % 3) as usize],
                start_date() + Days::new(i),
                100.0 + i as f64,
            )
        })
        .collect();
    let panel = add_lag_features(&compute_log_returns(&Panel::new(observations)), 1).unwrap();
    let split = chronological_split(&panel, 0.8).unwrap();

    assert_eq!(split.report.train_rows_before_drop, 80);
    assert_eq!(split.report.test_rows_before_drop, 20);
    assert_eq!(split.report.train_rows_dropped, 3);
    assert_eq!(split.report.test_rows_dropped, 0);
    assert_eq!(split.train_features.len(), split.train_labels.len());
    assert_eq!(split.test_features.len(), split.test_labels.len());
}

#[test]
fn single_observation_entity_is_dropped_everywhere() {
    let day = |d| NaiveDate::from_ymd_opt(2024, 5, d).unwrap();
    let mut observations: Vec<Observation> = (1..=9)
        .map(|d| Observation::new("KBC.BR", day(d), 50.0 + d as f64))
        .collect();
    observations.push(Observation::new("SOLO.BR", day(9), 12.0));

    let panel = add_lag_features(&compute_log_returns(&Panel::new(observations)), 2).unwrap();
    let solo = panel
        .observations
        .iter()
        .find(|obs| obs.entity_id == "SOLO.BR")
        .unwrap();
    assert_eq!(solo.log_return, None);
    assert!(solo.lags.iter().all(Option::is_none));

    for ratio in [0.5, 0.9] {
        let split = chronological_split(&panel, ratio).unwrap();
        assert!(split
            .train_features
            .iter()
            .chain(&split.test_features)
            .all(|row| row.entity_id != "SOLO.BR"));
    }
}

#[test]
fn more_lags_than_history_leaves_tail_undefined() {
    let day = |d| NaiveDate::from_ymd_opt(2024, 6, d).unwrap();
    let observations: Vec<Observation> = (1..=5)
        .map(|d| Observation::new("UCB.BR", day(d), 80.0 * (1.0 + d as f64 / 100.0)))
        .collect();
    let panel = add_lag_features(&compute_log_returns(&Panel::new(observations)), 10).unwrap();

    for (pos, obs) in panel.observations.iter().enumerate() {
        assert_eq!(obs.lags.len(), 10);
        for i in 6..=10 {
            assert_eq!(obs.lag(i), None);
        }
        for i in 1..=5 {
            assert_eq!(obs.lag(i).is_some(), pos > i, "pos={pos} lag_{i}");
        }
    }
}

#[test]
fn inference_rows_shift_lags_by_one_period() {
    let panel = add_lag_features(&compute_log_returns(&random_panel(3, 45)), 4).unwrap();
    let latest = panel.latest_date().unwrap();
    let rows = latest_feature_rows(&panel, 4).unwrap();

    assert!(!rows.is_empty());
    let groups = per_entity_sorted(&panel);
    for row in &rows {
        assert_eq!(row.date, latest);
        let history = &groups[&row.entity_id];
        let current = history.last().unwrap();
        assert_eq!(current.date, latest);
        assert_eq!(row.lag(1), current.log_return);
        for i in 2..=4 {
            assert_eq!(row.lag(i), current.lag(i - 1));
        }
    }
    assert!(rows.windows(2).all(|pair| pair[0].entity_id < pair[1].entity_id));
}

#[test]
fn invalid_arguments_are_rejected() {
    let panel = random_panel(1, 10);
    assert_eq!(
        latest_feature_rows(&panel, 0).unwrap_err(),
        FeatureError::InvalidArgument("n_lags must be >= 1".to_string())
    );
    assert!(chronological_split(&panel, 1.0).is_err());

    let empty = chronological_split(&Panel::default(), 0.8).unwrap();
    assert!(empty.train_features.is_empty());
    assert!(empty.test_labels.is_empty());
}

#[test]
fn non_positive_prices_leave_returns_undefined_and_drop_from_split() {
    let day = |d| NaiveDate::from_ymd_opt(2024, 7, d).unwrap();
    let observations: Vec<Observation> = [10.0, 0.0, -3.0, 10.0, 11.0]
        .into_iter()
        .zip(1..)
        .map(|(price, d)| Observation::new("ELI.BR", day(d), price))
        .collect();

    let panel = compute_log_returns(&Panel::new(observations));
    let returns: Vec<Option<f64>> = panel.observations.iter().map(|obs| obs.log_return).collect();
    assert_eq!(returns[..4], [None, None, None, None]);
    let last = returns[4].unwrap();
    assert!((last - (11.0_f64 / 10.0).ln()).abs() < 1e-12);

    let lagged = add_lag_features(&panel, 1).unwrap();
    let split = chronological_split(&lagged, 0.8).unwrap();
    assert_eq!(split.report.train_rows_before_drop, 4);
    assert_eq!(split.report.train_rows_dropped, 4);
    assert!(split.train_labels.is_empty());
    assert_eq!(split.report.test_rows_dropped, 0);
    assert_eq!(split.test_labels.len(), 1);
    assert!((split.test_labels[0] - last).abs() < 1e-12);
    assert_eq!(split.test_features[0].date, day(5));
}
