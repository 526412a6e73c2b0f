// Checkpoint — Save and load network weights
//
// JSON checkpoint format:
//
//   {
//     "version": 1,
//     "layers": [
//       {
//         "index": 0,                       position in the network
//         "kind": "convolution",
//         "tensors": [
//           { "format": "NCHW", "dtype": "f32", "shape": [4, 2, 3, 3],
//             "values": [ ... ] }           packed order, one per weight
//         ]
//       }
//     ]
//   }
//
// Only weight-bearing layers are listed, in network order. Loading aligns
// the saved layers with the network's weight-bearing layers one for one and
// refuses any record whose kind, dtype, format or shape disagrees.
//
// Usage:
//   checkpoint::save("net.json", &network)?;
//   checkpoint::load("net.json", &mut network)?;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use strata_core::{Backend, Error, Result};
use strata_nn::{LayerRecord, Network, TensorRecord};

const VERSION: u32 = 1;

/// One weight tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedTensor {
    pub format: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

/// The weights of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedLayer {
    pub index: usize,
    pub kind: String,
    pub tensors: Vec<SavedTensor>,
}

/// Every weight of a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub layers: Vec<SavedLayer>,
}

impl From<&TensorRecord> for SavedTensor {
    fn from(r: &TensorRecord) -> Self {
        SavedTensor {
            format: r.format.to_string(),
            dtype: r.dtype.to_string(),
            shape: r.shape.clone(),
            values: r.values.clone(),
        }
    }
}

impl TryFrom<&SavedTensor> for TensorRecord {
    type Error = Error;

    fn try_from(t: &SavedTensor) -> Result<Self> {
        Ok(TensorRecord {
            format: t.format.parse()?,
            dtype: t.dtype.parse()?,
            shape: t.shape.clone(),
            values: t.values.clone(),
        })
    }
}

impl From<&LayerRecord> for SavedLayer {
    fn from(r: &LayerRecord) -> Self {
        SavedLayer {
            index: r.index,
            kind: r.kind.to_string(),
            tensors: r.tensors.iter().map(SavedTensor::from).collect(),
        }
    }
}

impl TryFrom<&SavedLayer> for LayerRecord {
    type Error = Error;

    fn try_from(l: &SavedLayer) -> Result<Self> {
        Ok(LayerRecord {
            index: l.index,
            kind: l.kind.parse()?,
            tensors: l
                .tensors
                .iter()
                .map(TensorRecord::try_from)
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

impl Checkpoint {
    /// Copy every weight of `network` to the host.
    pub fn capture<B: Backend>(network: &Network<B>) -> Result<Self> {
        let layers = network
            .weight_records()?
            .iter()
            .map(SavedLayer::from)
            .collect();
        Ok(Checkpoint {
            version: VERSION,
            layers,
        })
    }

    /// Write these weights into `network`.
    pub fn restore<B: Backend>(&self, network: &mut Network<B>) -> Result<()> {
        if self.version != VERSION {
            return Err(Error::msg(format!(
                "unsupported checkpoint version {} (expected {VERSION})",
                self.version
            )));
        }
        let records = self
            .layers
            .iter()
            .map(LayerRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        network.load_weight_records(&records)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::msg(format!("checkpoint encode: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::msg(format!("checkpoint decode: {e}")))
    }
}

/// Serialize `network`'s weights as JSON into `writer`.
pub fn write_json<B: Backend, W: Write>(writer: W, network: &Network<B>) -> Result<()> {
    let ckpt = Checkpoint::capture(network)?;
    serde_json::to_writer(writer, &ckpt)
        .map_err(|e| Error::msg(format!("checkpoint encode: {e}")))?;
    log::debug!("wrote {} layer records", ckpt.layers.len());
    Ok(())
}

/// Read JSON weights from `reader` into `network`.
pub fn read_json<B: Backend, R: Read>(reader: R, network: &mut Network<B>) -> Result<()> {
    let ckpt: Checkpoint = serde_json::from_reader(reader)
        .map_err(|e| Error::msg(format!("checkpoint decode: {e}")))?;
    ckpt.restore(network)?;
    log::debug!("restored {} layer records", ckpt.layers.len());
    Ok(())
}

/// Save `network`'s weights to a JSON file.
pub fn save<B: Backend>(path: impl AsRef<Path>, network: &Network<B>) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", path.display())))?;
    let mut writer = BufWriter::new(file);
    write_json(&mut writer, network)?;
    writer
        .flush()
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))
}

/// Load weights from a JSON file into `network`.
pub fn load<B: Backend>(path: impl AsRef<Path>, network: &mut Network<B>) -> Result<()> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    read_json(BufReader::new(file), network)
}
