//! Python bindings for the evstream frame decoder with numpy support.
//!
//! Decoded events are returned in columnar form (separate arrays for x, y,
//! polarity and timestamp), which maps directly onto numpy arrays.

use evstream_core::{bitplane, BitOrder, Config, Event, FrameDecoder};
use numpy::{IntoPyArray, PyArray1};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::str::FromStr;
use std::sync::Arc;

/// Container for decoded events with numpy column access.
#[pyclass]
pub struct Events {
    x: Vec<u16>,
    y: Vec<u16>,
    /// 1 = positive channel, 0 = negative channel
    polarity: Vec<u8>,
    timestamp: Vec<u64>,
    sensor_width: u32,
    sensor_height: u32,
}

#[pymethods]
impl Events {
    fn __len__(&self) -> usize {
        self.x.len()
    }

    fn __repr__(&self) -> String {
        format!(
            "Events(count={}, sensor={}x{})",
            self.x.len(),
            self.sensor_width,
            self.sensor_height
        )
    }

    /// X coordinates as a numpy array.
    #[getter]
    fn x<'py>(&self, py: Python<'py>) -> &'py PyArray1<u16> {
        self.x.clone().into_pyarray(py)
    }

    /// Y coordinates as a numpy array.
    #[getter]
    fn y<'py>(&self, py: Python<'py>) -> &'py PyArray1<u16> {
        self.y.clone().into_pyarray(py)
    }

    /// Polarities as a numpy array: 1 = positive, 0 = negative.
    #[getter]
    fn polarity<'py>(&self, py: Python<'py>) -> &'py PyArray1<u8> {
        self.polarity.clone().into_pyarray(py)
    }

    /// Alias for polarity.
    #[getter]
    fn p<'py>(&self, py: Python<'py>) -> &'py PyArray1<u8> {
        self.polarity.clone().into_pyarray(py)
    }

    /// Timestamps as a numpy array.
    #[getter]
    fn timestamp<'py>(&self, py: Python<'py>) -> &'py PyArray1<u64> {
        self.timestamp.clone().into_pyarray(py)
    }

    /// Alias for timestamp.
    #[getter]
    fn t<'py>(&self, py: Python<'py>) -> &'py PyArray1<u64> {
        self.timestamp.clone().into_pyarray(py)
    }

    /// Sensor geometry as `(width, height)`.
    #[getter]
    fn sensor_size(&self) -> (u32, u32) {
        (self.sensor_width, self.sensor_height)
    }

    /// All columns as a dictionary, e.g. for a pandas DataFrame.
    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<PyObject> {
        let dict = PyDict::new(py);
        dict.set_item("x", self.x.clone().into_pyarray(py))?;
        dict.set_item("y", self.y.clone().into_pyarray(py))?;
        dict.set_item("polarity", self.polarity.clone().into_pyarray(py))?;
        dict.set_item("timestamp", self.timestamp.clone().into_pyarray(py))?;
        Ok(dict.into())
    }
}

impl Events {
    fn from_events(events: &[Event], width: u32, height: u32) -> Self {
        let len = events.len();
        let mut x = Vec::with_capacity(len);
        let mut y = Vec::with_capacity(len);
        let mut polarity = Vec::with_capacity(len);
        let mut timestamp = Vec::with_capacity(len);

        for event in events {
            x.push(event.x);
            y.push(event.y);
            polarity.push(u8::from(event.polarity));
            timestamp.push(event.timestamp);
        }

        Self {
            x,
            y,
            polarity,
            timestamp,
            sensor_width: width,
            sensor_height: height,
        }
    }
}

/// Decodes one bit-plane frame into events.
///
/// Args:
///     data: Frame payload, exactly 2 * ceil(width / 8) * height bytes
///     frame_number: Sequence number used for the timestamp
///     width: Sensor width in pixels
///     height: Sensor height in pixels
///     timestamp_interval: Timestamp units per frame (default: 1)
///     bit_order: "msb-first" (default) or "lsb-first"
///
/// Returns:
///     Events: Container with x, y, polarity and timestamp arrays
///
/// Raises:
///     ValueError: On invalid geometry or a payload of the wrong size
///
/// Example:
///     >>> import evstream
///     >>> events = evstream.decode_frame(payload, 0, 640, 480)
///     >>> print(f"Decoded {len(events)} events")
#[pyfunction]
#[pyo3(signature = (data, frame_number, width, height, timestamp_interval=1, bit_order="msb-first"))]
fn decode_frame(
    py: Python<'_>,
    data: &[u8],
    frame_number: u64,
    width: u32,
    height: u32,
    timestamp_interval: u64,
    bit_order: &str,
) -> PyResult<Py<Events>> {
    let order = BitOrder::from_str(bit_order).map_err(PyValueError::new_err)?;
    let config = Config::new(width, height)
        .map_err(|e| PyValueError::new_err(e.to_string()))?
        .with_timestamp_interval(timestamp_interval)
        .with_bit_order(order);
    let decoder = FrameDecoder::new(Arc::new(config));

    let mut events = Vec::new();
    decoder
        .unpack(data, frame_number, &mut events)
        .map_err(|e| PyValueError::new_err(e.to_string()))?;

    Py::new(py, Events::from_events(&events, width, height))
}

/// Returns the payload size in bytes of a frame with the given geometry.
#[pyfunction]
fn expected_frame_size(width: u32, height: u32) -> usize {
    bitplane::frame_size(width, height)
}

/// evstream frame decoder module for Python.
#[pymodule]
fn evstream(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(decode_frame, m)?)?;
    m.add_function(wrap_pyfunction!(expected_frame_size, m)?)?;
    m.add_class::<Events>()?;
    Ok(())
}
