use cv_core::sample_consensus::{Consensus, Estimator, Model};
use log::*;
use rand::{seq::index::sample, RngCore};

/// Minimal samples drawn per trial before the trial is given up as degenerate.
const MAX_DEGENERATE_DRAWS: usize = 100;

/// Fixed-budget random sample consensus.
///
/// Every trial fits the estimator to `MIN_SAMPLES` distinct data points drawn
/// uniformly with the provided RNG and scores the resulting models by how many
/// data points have a residual below the inlier threshold. The model with the
/// strictly highest count wins; earlier models win ties. Seeding the RNG makes
/// the outcome reproducible.
#[derive(Debug, Clone)]
pub struct Ransac<R> {
    inlier_threshold: f64,
    max_iterations: usize,
    min_inliers: usize,
    rng: R,
}

impl<R> Ransac<R>
where
    R: RngCore,
{
    /// `inlier_threshold` is the residual below which a datum counts as an inlier.
    ///
    /// Runs 2000 trials by default and accepts a model with at least 4 inliers.
    pub fn new(inlier_threshold: f64, rng: R) -> Self {
        Self {
            inlier_threshold,
            max_iterations: 2000,
            min_inliers: 4,
            rng,
        }
    }

    /// Number of trials to run.
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    /// Consensus fails when the best model has fewer inliers than this.
    pub fn min_inliers(self, min_inliers: usize) -> Self {
        Self {
            min_inliers,
            ..self
        }
    }

    fn inliers<M, Data>(&self, model: &M, data: &[Data]) -> Vec<usize>
    where
        M: Model<Data>,
    {
        data.iter()
            .enumerate()
            .filter(|(_, datum)| model.residual(datum) < self.inlier_threshold)
            .map(|(index, _)| index)
            .collect()
    }

    /// Draw minimal samples until the estimator produces at least one model.
    fn sample_models<E, Data>(&mut self, estimator: &E, data: &[Data]) -> Vec<E::Model>
    where
        E: Estimator<Data>,
        Data: Clone,
    {
        for _ in 0..MAX_DEGENERATE_DRAWS {
            let drawn: Vec<Data> = sample(&mut self.rng, data.len(), E::MIN_SAMPLES)
                .iter()
                .map(|index| data[index].clone())
                .collect();
            let models: Vec<E::Model> = estimator
                .estimate(drawn.iter().cloned())
                .into_iter()
                .collect();
            if !models.is_empty() {
                return models;
            }
        }
        vec![]
    }
}

impl<E, R, Data> Consensus<E, Data> for Ransac<R>
where
    E: Estimator<Data>,
    R: RngCore,
    Data: Clone,
{
    type Inliers = Vec<usize>;

    fn model<I>(&mut self, estimator: &E, data: I) -> Option<E::Model>
    where
        I: Iterator<Item = Data> + Clone,
    {
        self.model_inliers(estimator, data).map(|(model, _)| model)
    }

    fn model_inliers<I>(&mut self, estimator: &E, data: I) -> Option<(E::Model, Self::Inliers)>
    where
        I: Iterator<Item = Data> + Clone,
    {
        let data: Vec<Data> = data.collect();
        if data.len() < E::MIN_SAMPLES {
            debug!(
                "RANSAC needs {} data points, got {}",
                E::MIN_SAMPLES,
                data.len()
            );
            return None;
        }
        let mut best: Option<(E::Model, Vec<usize>)> = None;
        let mut degenerate_trials = 0usize;
        for _ in 0..self.max_iterations {
            let models = self.sample_models(estimator, &data);
            if models.is_empty() {
                degenerate_trials += 1;
                continue;
            }
            for model in models {
                let inliers = self.inliers(&model, &data);
                if best
                    .as_ref()
                    .map_or(true, |(_, best_inliers)| inliers.len() > best_inliers.len())
                {
                    best = Some((model, inliers));
                }
            }
        }
        debug!(
            "RANSAC ran {} trials ({} degenerate), best consensus {} of {}",
            self.max_iterations,
            degenerate_trials,
            best.as_ref().map_or(0, |(_, inliers)| inliers.len()),
            data.len()
        );
        best.filter(|(_, inliers)| inliers.len() >= self.min_inliers)
    }
}
