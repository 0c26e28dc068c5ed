//! Joint training of the item and user towers on labeled interaction pairs.

use std::collections::HashMap;

use ndarray::{Array1, Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, info};

use super::preprocess::data_preprocess;
use super::{EncoderInput, EncoderMode, ModelError, TowerEncoder, TowerKind};
use crate::frame::Frame;
use crate::registry::{ITEM_ID, USER_ID};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pair {
    user: usize,
    item: usize,
    label: f32,
}

/// Encoded entities plus the labeled `(user, item)` pairs between them.
#[derive(Debug, Clone)]
pub struct TrainingData {
    items: EncoderInput,
    users: EncoderInput,
    pairs: Vec<Pair>,
}

fn index_by_id(input: &EncoderInput) -> HashMap<i64, usize> {
    let mut index = HashMap::with_capacity(input.len());
    for (row, id) in input.ids.iter().enumerate() {
        index.entry(*id).or_insert(row);
    }
    index
}

fn collect_pairs(
    interactions: &Frame,
    label: f32,
    users: &HashMap<i64, usize>,
    items: &HashMap<i64, usize>,
    pairs: &mut Vec<Pair>,
) -> Result<usize, ModelError> {
    if interactions.num_rows() == 0 {
        return Ok(0);
    }
    let user_ids = interactions.int64_column(USER_ID)?;
    let item_ids = interactions.int64_column(ITEM_ID)?;
    let before = pairs.len();
    for (user_id, item_id) in user_ids.iter().zip(item_ids) {
        let (Some(user_id), Some(item_id)) = (user_id, item_id) else {
            continue;
        };
        if let (Some(&user), Some(&item)) = (users.get(user_id), items.get(item_id)) {
            pairs.push(Pair { user, item, label });
        }
    }
    Ok(pairs.len() - before)
}

impl TrainingData {
    /// Encodes the entity tables and labels positive interactions 1 and
    /// negative ones 0. Pairs naming an unknown or null id are skipped.
    ///
    /// # Errors
    /// Fails when a table lacks its id columns, when encoding fails, or when
    /// no positive pair survives.
    pub fn from_frames(
        items: &Frame,
        users: &Frame,
        positives: &Frame,
        negatives: &Frame,
    ) -> Result<Self, ModelError> {
        let items = data_preprocess(items, TowerKind::Item)?;
        let users = data_preprocess(users, TowerKind::User)?;
        let item_index = index_by_id(&items);
        let user_index = index_by_id(&users);

        let mut pairs = Vec::new();
        let positive = collect_pairs(positives, 1.0, &user_index, &item_index, &mut pairs)?;
        if positive == 0 {
            return Err(ModelError::EmptyInteractions);
        }
        let negative = collect_pairs(negatives, 0.0, &user_index, &item_index, &mut pairs)?;
        debug!(positive, negative, "assembled training pairs");

        Ok(Self { items, users, pairs })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    #[must_use]
    pub fn positives(&self) -> usize {
        self.pairs.iter().filter(|p| p.label > 0.5).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub epochs: usize,
    pub examples: usize,
    pub positives: usize,
    pub epoch_losses: Vec<f32>,
}

impl TrainReport {
    #[must_use]
    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }
}

/// Fits both towers jointly and leaves them in eval mode.
pub trait TwoTowerTrainer: Send + Sync {
    /// # Errors
    /// Fails on encoder errors, mismatched tower widths or a diverging loss.
    fn train(
        &self,
        item_model: &mut dyn TowerEncoder,
        user_model: &mut dyn TowerEncoder,
        data: &TrainingData,
    ) -> Result<TrainReport, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            learning_rate: 0.05,
            batch_size: 256,
            seed: 42,
        }
    }
}

/// Mini-batch SGD on the logistic loss of the tower dot product.
#[derive(Debug, Clone, Copy, Default)]
pub struct SgdTwoTowerTrainer {
    config: TrainerConfig,
}

impl SgdTwoTowerTrainer {
    #[must_use]
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }
}

fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl TwoTowerTrainer for SgdTwoTowerTrainer {
    #[allow(clippy::cast_precision_loss)]
    fn train(
        &self,
        item_model: &mut dyn TowerEncoder,
        user_model: &mut dyn TowerEncoder,
        data: &TrainingData,
    ) -> Result<TrainReport, ModelError> {
        if item_model.embedding_dim() != user_model.embedding_dim() {
            return Err(ModelError::TowerWidth {
                item: item_model.embedding_dim(),
                user: user_model.embedding_dim(),
            });
        }

        item_model.set_mode(EncoderMode::Train);
        user_model.set_mode(EncoderMode::Train);

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut order: Vec<usize> = (0..data.pairs.len()).collect();
        let batch_size = self.config.batch_size.max(1);
        let mut epoch_losses = Vec::with_capacity(self.config.epochs);

        for epoch in 0..self.config.epochs {
            order.shuffle(&mut rng);
            let mut total = 0.0_f32;

            for batch in order.chunks(batch_size) {
                let pairs: Vec<Pair> = batch.iter().map(|&i| data.pairs[i]).collect();
                let user_rows: Vec<usize> = pairs.iter().map(|p| p.user).collect();
                let item_rows: Vec<usize> = pairs.iter().map(|p| p.item).collect();
                let labels = Array1::from_iter(pairs.iter().map(|p| p.label));

                let users = user_model.forward(&data.users.select(&user_rows))?;
                let items = item_model.forward(&data.items.select(&item_rows))?;
                let scores = (&users * &items).sum_axis(Axis(1));

                let n = pairs.len() as f32;
                total += scores
                    .iter()
                    .zip(&labels)
                    .map(|(&s, &y)| softplus(s) - y * s)
                    .sum::<f32>();

                let grad_scores: Array1<f32> = scores
                    .iter()
                    .zip(&labels)
                    .map(|(&s, &y)| (sigmoid(s) - y) / n)
                    .collect();
                let grad_column = grad_scores.insert_axis(Axis(1));
                let grad_users: Array2<f32> = &items * &grad_column;
                let grad_items: Array2<f32> = &users * &grad_column;

                user_model.backward(&grad_users, self.config.learning_rate)?;
                item_model.backward(&grad_items, self.config.learning_rate)?;
            }

            let loss = total / data.pairs.len().max(1) as f32;
            if !loss.is_finite() {
                return Err(ModelError::NonFiniteLoss { epoch });
            }
            debug!(epoch, loss, "training epoch finished");
            epoch_losses.push(loss);
        }

        item_model.set_mode(EncoderMode::Eval);
        user_model.set_mode(EncoderMode::Eval);

        let report = TrainReport {
            epochs: self.config.epochs,
            examples: data.len(),
            positives: data.positives(),
            epoch_losses,
        };
        info!(
            epochs = report.epochs,
            examples = report.examples,
            final_loss = report.final_loss(),
            "two-tower training finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Column, ColumnData};
    use crate::model::LinearTower;
    use crate::model::preprocess::input_dim;

    fn items() -> Frame {
        let ids: Vec<Option<i64>> = (1..=4).map(Some).collect();
        Frame::new(vec![
            Column::new("item_id", ColumnData::Int64(ids)),
            Column::new(
                "category",
                ColumnData::Utf8(vec![
                    Some("a".into()),
                    Some("a".into()),
                    Some("b".into()),
                    Some("b".into()),
                ]),
            ),
            Column::new("subcategory", ColumnData::Utf8(vec![None; 4])),
            Column::new("price", ColumnData::Float64(vec![Some(1.0); 4])),
            Column::new("avg_rating", ColumnData::Float64(vec![Some(4.0); 4])),
            Column::new("num_ratings", ColumnData::Int64(vec![Some(3); 4])),
        ])
        .unwrap()
    }

    fn users() -> Frame {
        Frame::new(vec![
            Column::new("user_id", ColumnData::Int64(vec![Some(10), Some(20)])),
            Column::new("age", ColumnData::Int64(vec![Some(30), Some(40)])),
            Column::new(
                "gender",
                ColumnData::Utf8(vec![Some("f".into()), Some("m".into())]),
            ),
            Column::new("signup_days", ColumnData::Int64(vec![Some(5), Some(500)])),
            Column::new("preferences", ColumnData::Utf8(vec![None, None])),
        ])
        .unwrap()
    }

    fn pairs(rows: &[(Option<i64>, Option<i64>)]) -> Frame {
        Frame::new(vec![
            Column::new(
                "user_id",
                ColumnData::Int64(rows.iter().map(|(u, _)| *u).collect()),
            ),
            Column::new(
                "item_id",
                ColumnData::Int64(rows.iter().map(|(_, i)| *i).collect()),
            ),
        ])
        .unwrap()
    }

    fn towers() -> (LinearTower, LinearTower) {
        (
            LinearTower::new(TowerKind::Item, input_dim(TowerKind::Item), 8, 0.0, 1),
            LinearTower::new(TowerKind::User, input_dim(TowerKind::User), 8, 0.0, 2),
        )
    }

    #[test]
    fn unknown_and_null_ids_are_skipped() {
        let data = TrainingData::from_frames(
            &items(),
            &users(),
            &pairs(&[(Some(10), Some(1)), (Some(99), Some(1)), (None, Some(2))]),
            &pairs(&[(Some(20), Some(7)), (Some(20), Some(3))]),
        )
        .unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.positives(), 1);
    }

    #[test]
    fn no_usable_positive_is_an_error() {
        let err = TrainingData::from_frames(
            &items(),
            &users(),
            &pairs(&[(Some(99), Some(1))]),
            &pairs(&[(Some(10), Some(1))]),
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::EmptyInteractions));
    }

    #[test]
    fn training_lowers_the_loss_and_ends_in_eval_mode() {
        let data = TrainingData::from_frames(
            &items(),
            &users(),
            &pairs(&[
                (Some(10), Some(1)),
                (Some(10), Some(2)),
                (Some(20), Some(3)),
                (Some(20), Some(4)),
            ]),
            &pairs(&[
                (Some(10), Some(3)),
                (Some(10), Some(4)),
                (Some(20), Some(1)),
                (Some(20), Some(2)),
            ]),
        )
        .unwrap();
        let (mut item, mut user) = towers();
        let trainer = SgdTwoTowerTrainer::new(TrainerConfig {
            epochs: 40,
            learning_rate: 0.05,
            batch_size: 4,
            seed: 7,
        });

        let report = trainer.train(&mut item, &mut user, &data).unwrap();
        assert_eq!(report.epoch_losses.len(), 40);
        assert!(report.final_loss().unwrap() < report.epoch_losses[0]);
        assert_eq!(item.mode(), EncoderMode::Eval);
        assert_eq!(user.mode(), EncoderMode::Eval);
    }

    #[test]
    fn mismatched_tower_widths_are_rejected() {
        let data = TrainingData::from_frames(
            &items(),
            &users(),
            &pairs(&[(Some(10), Some(1))]),
            &pairs(&[]),
        )
        .unwrap();
        let mut item = LinearTower::new(TowerKind::Item, input_dim(TowerKind::Item), 8, 0.0, 1);
        let mut user = LinearTower::new(TowerKind::User, input_dim(TowerKind::User), 4, 0.0, 1);
        let err = SgdTwoTowerTrainer::default()
            .train(&mut item, &mut user, &data)
            .unwrap_err();
        assert!(matches!(err, ModelError::TowerWidth { item: 8, user: 4 }));
    }
}
