//! Flat binary files of `f64` matrices.
//!
//! The flat format is a bare sequence of big-endian 8-byte doubles in
//! row-major order. It has no header and no length prefix, so the reader must
//! be handed a destination with the same shape the writer used. A short file
//! fills only the leading elements of the destination; the rest keep whatever
//! value they had before the read.
//!
//! [`MatrixFileFormat::Header`] stores the same payload behind a small header
//! (`CMAT`, rows, cols as big-endian `u32`) so that a shape mismatch or a
//! truncated file can be detected instead of silently tolerated.

use std::{
    fs::File,
    io::{BufReader, BufWriter, ErrorKind, Read, Write},
    path::Path,
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::{
    Dim, Matrix,
    storage::{RawStorage, RawStorageMut},
};
use tracing::{debug, warn};

use crate::{Error, Result};

/// First four bytes of a matrix file with header.
pub const HEADER_MAGIC: &[u8; 4] = b"CMAT";

/// On-disk layout of a persisted matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatrixFileFormat {
    /// Bare row-major doubles.
    #[default]
    Flat,
    /// Magic and shape, then the flat payload.
    Header,
}

impl std::fmt::Display for MatrixFileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MatrixFileFormat::Flat => write!(f, "flat"),
            MatrixFileFormat::Header => write!(f, "header"),
        }
    }
}

impl std::str::FromStr for MatrixFileFormat {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" => Ok(MatrixFileFormat::Flat),
            "header" => Ok(MatrixFileFormat::Header),
            _ => Err(Error::UnknownMatrixFormat(s.to_string())),
        }
    }
}

/// Write every element of `m` in row-major order.
pub fn write_matrix<W, R, C, S>(mut wtr: W, m: &Matrix<f64, R, C, S>) -> std::io::Result<()>
where
    W: Write,
    R: Dim,
    C: Dim,
    S: RawStorage<f64, R, C>,
{
    for row in 0..m.nrows() {
        for col in 0..m.ncols() {
            wtr.write_f64::<BigEndian>(m[(row, col)])?;
        }
    }
    Ok(())
}

/// Read doubles into `m` in row-major order until the reader is exhausted or
/// `m` is full.
///
/// Returns the number of values stored. End of input, including a trailing
/// partial value, ends the read normally. Elements past the returned count
/// are left untouched.
pub fn read_matrix<Rd, R, C, S>(mut rdr: Rd, m: &mut Matrix<f64, R, C, S>) -> std::io::Result<usize>
where
    Rd: Read,
    R: Dim,
    C: Dim,
    S: RawStorageMut<f64, R, C>,
{
    let ncols = m.ncols();
    let total = m.nrows() * ncols;
    let mut values = Vec::with_capacity(total);
    while values.len() < total {
        match rdr.read_f64::<BigEndian>() {
            Ok(v) => values.push(v),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    for (i, v) in values.iter().enumerate() {
        m[(i / ncols, i % ncols)] = *v;
    }
    Ok(values.len())
}

fn write_header<W: Write>(mut wtr: W, nrows: usize, ncols: usize) -> std::io::Result<()> {
    let to_u32 = |n: usize| {
        u32::try_from(n).map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "matrix too large"))
    };
    wtr.write_all(HEADER_MAGIC)?;
    wtr.write_u32::<BigEndian>(to_u32(nrows)?)?;
    wtr.write_u32::<BigEndian>(to_u32(ncols)?)?;
    Ok(())
}

fn io_path(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::IoPath {
        path: path.display().to_string(),
        source,
    }
}

/// Save `m` to `path` in the given format, replacing any existing file.
///
/// On failure the file may be left truncated.
pub fn save_double_mat<P, R, C, S>(
    path: P,
    m: &Matrix<f64, R, C, S>,
    format: MatrixFileFormat,
) -> Result<()>
where
    P: AsRef<Path>,
    R: Dim,
    C: Dim,
    S: RawStorage<f64, R, C>,
{
    let path = path.as_ref();
    debug!("Saving double matrix: {}", path.display());
    let file = File::create(path).map_err(io_path(path))?;
    let mut wtr = BufWriter::new(file);
    if format == MatrixFileFormat::Header {
        write_header(&mut wtr, m.nrows(), m.ncols()).map_err(io_path(path))?;
    }
    write_matrix(&mut wtr, m).map_err(io_path(path))?;
    wtr.flush().map_err(io_path(path))?;
    Ok(())
}

/// Load `path` into the pre-shaped matrix `m`.
///
/// Returns the number of elements overwritten. With the flat format a short
/// file is tolerated: a warning is logged and the untouched elements keep
/// their previous values. With the header format the stored shape must equal
/// the shape of `m` and the payload must be complete.
pub fn load_double_mat<P, R, C, S>(
    path: P,
    m: &mut Matrix<f64, R, C, S>,
    format: MatrixFileFormat,
) -> Result<usize>
where
    P: AsRef<Path>,
    R: Dim,
    C: Dim,
    S: RawStorageMut<f64, R, C>,
{
    let path = path.as_ref();
    debug!("Loading double matrix: {}", path.display());
    let expected = m.nrows() * m.ncols();
    let file = File::open(path).map_err(io_path(path))?;
    let mut rdr = BufReader::new(file);

    if format == MatrixFileFormat::Header {
        let mut magic = [0u8; 4];
        match rdr.read_exact(&mut magic) {
            Ok(()) if &magic == HEADER_MAGIC => {}
            Ok(()) => {
                return Err(Error::BadMagic {
                    path: path.display().to_string(),
                });
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(Error::BadMagic {
                    path: path.display().to_string(),
                });
            }
            Err(e) => return Err(io_path(path)(e)),
        }
        let nrows = rdr.read_u32::<BigEndian>().map_err(io_path(path))? as usize;
        let ncols = rdr.read_u32::<BigEndian>().map_err(io_path(path))? as usize;
        if (nrows, ncols) != m.shape() {
            return Err(Error::ShapeMismatch {
                path: path.display().to_string(),
                expected: m.shape(),
                found: (nrows, ncols),
            });
        }
    }

    let n_read = read_matrix(&mut rdr, m).map_err(io_path(path))?;

    if n_read < expected {
        if format == MatrixFileFormat::Header {
            return Err(Error::Truncated {
                path: path.display().to_string(),
                expected,
                got: n_read,
            });
        }
        warn!(
            "{}: read {n_read} of {expected} values, remaining elements keep their previous values",
            path.display()
        );
    } else {
        let mut probe = [0u8; 1];
        if rdr.read(&mut probe).map_err(io_path(path))? > 0 {
            warn!(
                "{}: ignoring data after the first {expected} values",
                path.display()
            );
        } else {
            debug!("EOF reached for: {}", path.display());
        }
    }
    Ok(n_read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, Matrix3, Vector5};

    #[test]
    fn flat_layout_is_big_endian_row_major() {
        let m = nalgebra::Matrix2::new(1.0, 2.0, 3.0, 4.0);
        let mut buf = Vec::new();
        write_matrix(&mut buf, &m).unwrap();
        assert_eq!(buf.len(), 32);
        let mut expected = Vec::new();
        for v in [1.0f64, 2.0, 3.0, 4.0] {
            expected.extend_from_slice(&v.to_be_bytes());
        }
        assert_eq!(buf, expected);
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let vals = [
            812.345_678_901_234_5,
            -0.0,
            f64::MIN_POSITIVE,
            1e-300,
            f64::MAX,
            -1.0 / 3.0,
            f64::EPSILON,
            12345.678,
            1.0,
        ];
        let m = Matrix3::from_row_slice(&vals);
        let mut buf = Vec::new();
        write_matrix(&mut buf, &m).unwrap();

        let mut out = Matrix3::<f64>::identity();
        let n = read_matrix(&buf[..], &mut out).unwrap();
        assert_eq!(n, 9);
        for (a, b) in m.iter().zip(out.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn short_stream_leaves_tail_untouched() {
        let mut buf = Vec::new();
        write_matrix(&mut buf, &nalgebra::Vector3::new(0.1, 0.2, 0.3)).unwrap();
        // half a double of garbage at the end is treated as end of file
        buf.extend_from_slice(&[0xAB; 4]);

        let mut dest = Vector5::repeat(7.0);
        let n = read_matrix(&buf[..], &mut dest).unwrap();
        assert_eq!(n, 3);
        assert_eq!(dest.as_slice(), &[0.1, 0.2, 0.3, 7.0, 7.0]);
    }

    #[test]
    fn empty_stream_reads_nothing() {
        let mut dest = Matrix3::<f64>::identity();
        let n = read_matrix(std::io::empty(), &mut dest).unwrap();
        assert_eq!(n, 0);
        assert_eq!(dest, Matrix3::identity());
    }

    #[test]
    fn parse_format() {
        assert_eq!("flat".parse::<MatrixFileFormat>().unwrap(), MatrixFileFormat::Flat);
        assert_eq!("Header".parse::<MatrixFileFormat>().unwrap(), MatrixFileFormat::Header);
        assert!("yaml".parse::<MatrixFileFormat>().is_err());
    }

    #[test]
    fn header_file_rejects_wrong_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.bin");
        let m = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        save_double_mat(&path, &m, MatrixFileFormat::Header).unwrap();

        let mut same = DMatrix::<f64>::zeros(2, 3);
        assert_eq!(load_double_mat(&path, &mut same, MatrixFileFormat::Header).unwrap(), 6);
        assert_eq!(same, m);

        let mut other = DMatrix::<f64>::zeros(3, 2);
        match load_double_mat(&path, &mut other, MatrixFileFormat::Header) {
            Err(Error::ShapeMismatch { expected, found, .. }) => {
                assert_eq!(expected, (3, 2));
                assert_eq!(found, (2, 3));
            }
            other => panic!("unexpected {other:?}"),
        }

        // a flat file is not a header file
        save_double_mat(&path, &m, MatrixFileFormat::Flat).unwrap();
        assert!(matches!(
            load_double_mat(&path, &mut same, MatrixFileFormat::Header),
            Err(Error::BadMagic { .. })
        ));
    }

    #[test]
    fn header_file_rejects_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.bin");
        let m = Matrix3::<f64>::identity();
        save_double_mat(&path, &m, MatrixFileFormat::Header).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 8]).unwrap();

        let mut dest = Matrix3::<f64>::zeros();
        assert!(matches!(
            load_double_mat(&path, &mut dest, MatrixFileFormat::Header),
            Err(Error::Truncated {
                expected: 9,
                got: 8,
                ..
            })
        ));
    }

    #[test]
    #[tracing_test::traced_test]
    fn short_flat_file_warns_and_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dist-coefs.bin");
        let written = Vector5::new(-0.2, 0.05, 0.001, -0.002, 0.0);
        save_double_mat(&path, &written, MatrixFileFormat::Flat).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 40);

        // a destination sized for the 8-term model only gets the first five
        let mut dest = nalgebra::DVector::<f64>::from_element(8, 9.0);
        let n = load_double_mat(&path, &mut dest, MatrixFileFormat::Flat).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&dest.as_slice()[..5], written.as_slice());
        assert_eq!(&dest.as_slice()[5..], &[9.0, 9.0, 9.0]);
        assert!(logs_contain("read 5 of 8 values"));

        // a smaller destination ignores the extra values
        let mut small = nalgebra::Vector3::<f64>::zeros();
        assert_eq!(load_double_mat(&path, &mut small, MatrixFileFormat::Flat).unwrap(), 3);
        assert_eq!(small.as_slice(), &written.as_slice()[..3]);
        assert!(logs_contain("ignoring data after the first 3 values"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut dest = Matrix3::<f64>::zeros();
        let r = load_double_mat(dir.path().join("nope.bin"), &mut dest, MatrixFileFormat::Flat);
        assert!(matches!(r, Err(Error::IoPath { .. })));
    }
}
