use ndarray::ArrayView2;

use crate::{
    engine::InferenceOutput,
    error::PredictorError,
    model::{ClassScore, PredictionResult},
};

pub(super) fn postprocess(
    outputs: &InferenceOutput,
    k: usize,
    batch_size: usize,
    labels: &[String],
) -> Result<Vec<PredictionResult>, PredictorError> {
    if k == 0 {
        return Err(PredictorError::BadInput("topk must be at least 1".into()));
    }
    let scores = outputs
        .named_or_at("scores", 0)
        .ok_or_else(|| PredictorError::InvalidOutput("missing classifier scores".into()))?
        .to_f32();

    let shape = scores.shape().to_vec();
    if shape.first() != Some(&batch_size) {
        return Err(PredictorError::InvalidOutput(format!(
            "classifier scores have shape {shape:?}, expected {batch_size} rows"
        )));
    }
    let classes: usize = shape[1..].iter().product();
    let scores = scores
        .into_shape_with_order((batch_size, classes))
        .map_err(|e| PredictorError::InvalidOutput(e.to_string()))?;

    Ok(top_k(scores.view(), k, labels)
        .into_iter()
        .map(PredictionResult::Classification)
        .collect())
}

/// Highest `k` scores per row, best first. Equal scores keep ascending
/// class order.
pub fn top_k(scores: ArrayView2<'_, f32>, k: usize, labels: &[String]) -> Vec<Vec<ClassScore>> {
    scores
        .rows()
        .into_iter()
        .map(|row| {
            let mut order: Vec<usize> = (0..row.len()).collect();
            order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
            order
                .into_iter()
                .take(k)
                .map(|class_id| ClassScore {
                    category_id: class_id,
                    category: labels
                        .get(class_id)
                        .cloned()
                        .unwrap_or_else(|| class_id.to_string()),
                    score: row[class_id],
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::engine::Tensor;

    fn labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("class_{i}")).collect()
    }

    #[test]
    fn ties_keep_ascending_class_order() {
        let scores = array![[0.1f32, 0.3, 0.3, 0.2, 0.1]];
        let ranked = top_k(scores.view(), 5, &labels(5));
        let ids: Vec<usize> = ranked[0].iter().map(|c| c.category_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 0, 4]);
        assert_eq!(ranked[0][0].category, "class_1");
    }

    #[test]
    fn decodes_each_batch_row() {
        let outputs = InferenceOutput::new(vec![(
            "softmax_0.tmp_0".into(),
            Tensor::from_f32(&[2, 3], vec![0.1, 0.7, 0.2, 0.6, 0.3, 0.1]).unwrap(),
        )]);
        let results = postprocess(&outputs, 1, 2, &labels(3)).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_classification().unwrap()[0].category_id, 1);
        assert_eq!(results[1].as_classification().unwrap()[0].category_id, 0);
    }

    #[test]
    fn row_count_must_match_batch() {
        let outputs = InferenceOutput::new(vec![(
            "scores".into(),
            Tensor::from_f32(&[1, 3], vec![0.1, 0.7, 0.2]).unwrap(),
        )]);
        let err = postprocess(&outputs, 1, 2, &labels(3)).unwrap_err();
        assert!(matches!(err, PredictorError::InvalidOutput(_)));
    }

    #[test]
    fn unnamed_labels_fall_back_to_index() {
        let scores = array![[0.2f32, 0.8]];
        let ranked = top_k(scores.view(), 1, &[]);
        assert_eq!(ranked[0][0].category, "1");
    }
}
