// src/evaluator/batch.rs - Scoring many configurations across sessions

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use futures::future::join_all;

use super::{Evaluation, Evaluator, FitnessTransform};
use crate::infra::errors::SearchError;
use crate::oracle::Session;
use crate::search::space::Configuration;

type WorkQueue = Mutex<VecDeque<usize>>;

impl Evaluator {
    /// Score every configuration, one worker per live session pulling from a
    /// shared queue. A worker whose session is lost hands its candidate back
    /// and stops; the rest keep going. Results are in input order.
    pub async fn score_batch(
        &self,
        sessions: &[Session],
        configs: &[Configuration],
        transform: FitnessTransform,
    ) -> Result<Vec<Evaluation>, SearchError> {
        let queue: WorkQueue = Mutex::new((0..configs.len()).collect());
        let mut results: Vec<Option<Evaluation>> = vec![None; configs.len()];

        loop {
            if lock(&queue).is_empty() {
                break;
            }
            let live: Vec<&Session> = sessions.iter().filter(|s| !s.is_lost()).collect();
            if live.is_empty() {
                return Err(SearchError::AllSessionsLost {
                    sessions: sessions.len(),
                });
            }

            let workers = live
                .into_iter()
                .map(|session| self.drain(session, &queue, configs, transform));
            for (idx, evaluation) in join_all(workers).await.into_iter().flatten() {
                results[idx] = Some(evaluation);
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(idx, r)| {
                r.ok_or_else(|| SearchError::Invariant(format!("candidate {idx} was never scored")))
            })
            .collect()
    }

    async fn drain(
        &self,
        session: &Session,
        queue: &WorkQueue,
        configs: &[Configuration],
        transform: FitnessTransform,
    ) -> Vec<(usize, Evaluation)> {
        let mut done = Vec::new();
        loop {
            let next = lock(queue).pop_front();
            let Some(idx) = next else { break };

            match self.score(session, &configs[idx], transform).await {
                Ok(evaluation) => done.push((idx, evaluation)),
                Err(e) => {
                    tracing::error!(session = %session.id(), "Session dropped from batch: {}", e);
                    lock(queue).push_back(idx);
                    break;
                }
            }
        }
        done
    }
}

fn lock(queue: &WorkQueue) -> std::sync::MutexGuard<'_, VecDeque<usize>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}
