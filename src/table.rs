//! Text-matrix tables
//!
//! Whitespace-delimited numeric tables used for motion parameters,
//! slice weights, radial basis functions and gradient schemes. Lines
//! starting with '#' are comments; all rows must have the same number
//! of columns.

use std::path::Path;

use crate::error::{SvrError, SvrResult};

/// Dense row-major matrix of f64 values
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    data: Vec<f64>,
    rows: usize,
    cols: usize,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Matrix { data: vec![0.0; rows * cols], rows, cols }
    }

    pub fn from_vec(data: Vec<f64>, rows: usize, cols: usize) -> Self {
        assert_eq!(data.len(), rows * cols, "matrix data length mismatch");
        Matrix { data, rows, cols }
    }

    /// Identity matrix of size n
    pub fn identity(n: usize) -> Self {
        let mut m = Matrix::new(n, n);
        for i in 0..n {
            m[(i, i)] = 1.0;
        }
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f64] {
        &mut self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// New matrix holding the listed rows, in order
    pub fn select_rows(&self, idx: &[usize]) -> Matrix {
        let mut out = Matrix::new(idx.len(), self.cols);
        for (i, &r) in idx.iter().enumerate() {
            out.row_mut(i).copy_from_slice(self.row(r));
        }
        out
    }

    /// New matrix holding the listed columns, in order
    pub fn select_cols(&self, idx: &[usize]) -> Matrix {
        let mut out = Matrix::new(self.rows, idx.len());
        for r in 0..self.rows {
            for (j, &c) in idx.iter().enumerate() {
                out[(r, j)] = self[(r, c)];
            }
        }
        out
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}

impl std::ops::Index<(usize, usize)> for Matrix {
    type Output = f64;
    fn index(&self, (r, c): (usize, usize)) -> &f64 {
        &self.data[r * self.cols + c]
    }
}

impl std::ops::IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (r, c): (usize, usize)) -> &mut f64 {
        &mut self.data[r * self.cols + c]
    }
}

/// Parse a matrix from text
///
/// Empty lines and '#' comment lines are skipped. Fields are separated
/// by whitespace or commas.
pub fn parse_matrix(text: &str) -> SvrResult<Matrix> {
    let mut values: Vec<f64> = Vec::new();
    let mut rows = 0usize;
    let mut cols = 0usize;

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<f64> = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|f| !f.is_empty())
            .map(|f| {
                f.parse::<f64>().map_err(|_| {
                    SvrError::InvalidArgument(format!(
                        "unparseable value '{}' on line {}", f, lineno + 1
                    ))
                })
            })
            .collect::<SvrResult<_>>()?;
        if fields.is_empty() {
            continue;
        }
        if rows == 0 {
            cols = fields.len();
        } else if fields.len() != cols {
            return Err(SvrError::InvalidArgument(format!(
                "inconsistent column count on line {}: expected {}, got {}",
                lineno + 1, cols, fields.len()
            )));
        }
        values.extend_from_slice(&fields);
        rows += 1;
    }

    if rows == 0 {
        return Err(SvrError::InvalidArgument("empty matrix file".into()));
    }
    Ok(Matrix::from_vec(values, rows, cols))
}

/// Load a matrix from a text file
pub fn load_matrix(path: &Path) -> SvrResult<Matrix> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| SvrError::Io(format!("failed to read '{}': {}", path.display(), e)))?;
    parse_matrix(&text)
}

/// Save a matrix as whitespace-delimited text
pub fn save_matrix(path: &Path, m: &Matrix) -> SvrResult<()> {
    let mut text = String::new();
    for r in 0..m.rows() {
        let fields: Vec<String> = m.row(r).iter().map(|v| format!("{}", v)).collect();
        text.push_str(&fields.join(" "));
        text.push('\n');
    }
    std::fs::write(path, text)
        .map_err(|e| SvrError::Io(format!("failed to write '{}': {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let m = parse_matrix("1 2 3\n4 5 6\n").unwrap();
        assert_eq!(m.rows(), 2);
        assert_eq!(m.cols(), 3);
        assert_eq!(m[(0, 0)], 1.0);
        assert_eq!(m[(1, 2)], 6.0);
    }

    #[test]
    fn test_parse_comments_and_blanks() {
        let m = parse_matrix("# gradient scheme\n\n0 0 1 0\n0 1 0 1000\n").unwrap();
        assert_eq!(m.rows(), 2);
        assert_eq!(m.cols(), 4);
        assert_eq!(m[(1, 3)], 1000.0);
    }

    #[test]
    fn test_parse_commas() {
        let m = parse_matrix("1,0,0,0\n0,1,0,700\n").unwrap();
        assert_eq!(m.rows(), 2);
        assert_eq!(m.cols(), 4);
        assert_eq!(m[(1, 1)], 1.0);
    }

    #[test]
    fn test_parse_ragged_rows_error() {
        let result = parse_matrix("1 2 3\n4 5\n");
        assert!(result.is_err(), "ragged matrix should be rejected");
    }

    #[test]
    fn test_parse_empty_error() {
        assert!(parse_matrix("# only a comment\n").is_err());
    }

    #[test]
    fn test_select_rows_cols() {
        let m = parse_matrix("1 2 3\n4 5 6\n7 8 9\n").unwrap();
        let r = m.select_rows(&[2, 0]);
        assert_eq!(r.row(0), &[7.0, 8.0, 9.0]);
        assert_eq!(r.row(1), &[1.0, 2.0, 3.0]);
        let c = m.select_cols(&[1]);
        assert_eq!(c.rows(), 3);
        assert_eq!(c.cols(), 1);
        assert_eq!(c[(2, 0)], 8.0);
    }

    #[test]
    fn test_roundtrip_file() {
        let m = parse_matrix("0.5 -1.25\n3 4\n").unwrap();
        let tmp = std::env::temp_dir().join("svr_table_roundtrip.txt");
        save_matrix(&tmp, &m).unwrap();
        let back = load_matrix(&tmp).unwrap();
        assert_eq!(m, back);
        std::fs::remove_file(&tmp).ok();
    }

    #[test]
    fn test_is_finite() {
        let mut m = Matrix::new(2, 2);
        assert!(m.is_finite());
        m[(0, 1)] = f64::NAN;
        assert!(!m.is_finite());
    }
}
