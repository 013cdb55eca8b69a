//! ROC-based metrics over the accumulated evaluation records.

/// One evaluated clip: its anomaly score and ground-truth label
/// (0 = normal, 1 = anomaly). Records accumulate append-only over an
/// evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct ResultRecord {
    pub score: f64,
    pub label: i64,
}

/// ROC curve points `(fprs, tprs)`, starting at (0, 0). Ties in the score
/// are grouped so the curve steps once per distinct threshold.
pub fn roc_curve(records: &[ResultRecord]) -> (Vec<f64>, Vec<f64>) {
    let mut sorted: Vec<&ResultRecord> = records.iter().collect();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let n_pos = sorted.iter().filter(|r| r.label == 1).count() as f64;
    let n_neg = sorted.len() as f64 - n_pos;

    let mut fprs = vec![0.0];
    let mut tprs = vec![0.0];
    if n_pos == 0.0 || n_neg == 0.0 {
        return (fprs, tprs);
    }

    let mut tp = 0.0;
    let mut fp = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let threshold = sorted[i].score;
        while i < sorted.len() && sorted[i].score == threshold {
            if sorted[i].label == 1 {
                tp += 1.0;
            } else {
                fp += 1.0;
            }
            i += 1;
        }
        fprs.push(fp / n_neg);
        tprs.push(tp / n_pos);
    }
    (fprs, tprs)
}

/// Trapezoid-rule area under a curve given as parallel x/y sequences.
pub fn auc(x: &[f64], y: &[f64]) -> f64 {
    let mut area = 0.0;
    for i in 1..x.len().min(y.len()) {
        area += (x[i] - x[i - 1]) * (y[i] + y[i - 1]) / 2.0;
    }
    area
}

/// AUC-ROC. Degenerate label sets (all normal or all anomalous) yield 0.5.
pub fn roc_auc_score(records: &[ResultRecord]) -> f64 {
    let n_pos = records.iter().filter(|r| r.label == 1).count();
    if n_pos == 0 || n_pos == records.len() {
        return 0.5;
    }
    let (fprs, tprs) = roc_curve(records);
    auc(&fprs, &tprs)
}

/// Partial AUC over the low-false-positive region FPR <= `fpr_limit`,
/// rescaled by the limit so a perfect detector scores 1.0.
pub fn partial_auc(records: &[ResultRecord], fpr_limit: f64) -> f64 {
    let n_pos = records.iter().filter(|r| r.label == 1).count();
    if n_pos == 0 || n_pos == records.len() {
        return 0.5;
    }
    let (fprs, tprs) = roc_curve(records);
    let n = fprs.iter().take_while(|&&f| f <= fpr_limit).count();
    auc(&fprs[..n], &tprs[..n]) / fpr_limit
}
