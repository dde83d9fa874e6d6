//! Maximum-weight bipartite matching between two signature lists.
//!
//! Used by the reconciliation engine to pair the author fields that appeared
//! on a record with the ones that disappeared, so a renamed field keeps its
//! identity. The solver is the Hungarian algorithm with row/column potentials
//! on costs `1 - score`, padded to a square matrix with zero-score dummies.
//!
//! Ties are broken by scanning columns in input order and only accepting
//! strict improvements, so identical inputs always give identical output.

use crate::error::ValidationError;

/// One matched pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    /// Row index (the "new" list).
    pub new_index: usize,
    /// Column index (the "old" list).
    pub old_index: usize,
    /// Similarity of the pair.
    pub score: f64,
}

fn validate(scores: &[Vec<f64>]) -> Result<usize, ValidationError> {
    let cols = scores.first().map_or(0, Vec::len);
    for (row, values) in scores.iter().enumerate() {
        if values.len() != cols {
            return Err(ValidationError::RaggedMatrix {
                row,
                actual: values.len(),
                expected: cols,
            });
        }
        if let Some(bad) = values.iter().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(ValidationError::ScoreOutOfRange { value: *bad });
        }
    }
    Ok(cols)
}

/// Returns the matching maximizing the summed score.
///
/// `scores[i][j]` is the similarity between new item `i` and old item `j`.
/// The result holds one entry per matched real pair, sorted by `new_index`.
/// Pairs involving padding never appear; a real pair with score 0 may.
///
/// # Errors
/// `RaggedMatrix` if rows differ in length, `ScoreOutOfRange` for values
/// outside `[0, 1]` (NaN included).
pub fn maximum_matching(scores: &[Vec<f64>]) -> Result<Vec<Match>, ValidationError> {
    let cols = validate(scores)?;
    let rows = scores.len();
    if rows == 0 || cols == 0 {
        return Ok(Vec::new());
    }

    let n = rows.max(cols);
    let cost = |i: usize, j: usize| -> f64 {
        if i < rows && j < cols {
            1.0 - scores[i][j]
        } else {
            1.0
        }
    };

    // 1-based potentials; column 0 is the virtual source.
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; n + 1];
    let mut row_of_col = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        row_of_col[0] = i;
        let mut j0 = 0usize;
        let mut min_slack = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];

        loop {
            used[j0] = true;
            let i0 = row_of_col[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;

            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let slack = cost(i0 - 1, j - 1) - u[i0] - v[j];
                if slack < min_slack[j] {
                    min_slack[j] = slack;
                    way[j] = j0;
                }
                if min_slack[j] < delta {
                    delta = min_slack[j];
                    j1 = j;
                }
            }

            for j in 0..=n {
                if used[j] {
                    u[row_of_col[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_slack[j] -= delta;
                }
            }

            j0 = j1;
            if row_of_col[j0] == 0 {
                break;
            }
        }

        loop {
            let j1 = way[j0];
            row_of_col[j0] = row_of_col[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut matches: Vec<Match> = (1..=n)
        .filter_map(|j| {
            let i = row_of_col[j];
            (i >= 1 && i <= rows && j <= cols).then(|| Match {
                new_index: i - 1,
                old_index: j - 1,
                score: scores[i - 1][j - 1],
            })
        })
        .collect();
    matches.sort_by_key(|m| m.new_index);
    Ok(matches)
}

/// Runs [`maximum_matching`] and keeps pairs scoring strictly above
/// `threshold`.
///
/// # Errors
/// Same as [`maximum_matching`].
pub fn accepted_matches(scores: &[Vec<f64>], threshold: f64) -> Result<Vec<Match>, ValidationError> {
    Ok(maximum_matching(scores)?
        .into_iter()
        .filter(|m| m.score > threshold)
        .collect())
}
