//! Streams line features (ways) out of an OpenStreetMap `.osm.pbf` extract.
//!
//! The extract is read twice: the first pass indexes node locations, the
//! second resolves every way's node references against that index. A reference
//! to a node the extract does not contain resolves to
//! [`UNRESOLVED_POSITION`], which makes the builder drop that way.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use futures::Stream;
use osmpbf::{Element, ElementReader};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::builder::SourceFeature;
use crate::error::Result;
use crate::geometry::{Coordinate, Tags, UNRESOLVED_POSITION};

const CHANNEL_CAPACITY: usize = 1024;

pub struct OsmSource {
    path: PathBuf,
}

impl OsmSource {
    pub fn new<P: AsRef<Path>>(path: P) -> OsmSource {
        OsmSource {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Starts reading on a blocking thread and returns the ways as a stream.
    ///
    /// Must be called from within a tokio runtime. Read errors are delivered
    /// as the last item of the stream.
    pub fn features(self) -> impl Stream<Item = Result<SourceFeature>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::task::spawn_blocking(move || {
            if let Err(e) = read_ways(&self.path, &tx) {
                error!(path = ?self.path, "failed to read extract: {}", e);
                let _ = tx.blocking_send(Err(e));
            }
        });

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
    }
}

/// Decimicro degrees (1e-7) to degrees.
fn degrees(decimicro: i32) -> f64 {
    f64::from(decimicro) / 1e7
}

/// Looks up each node reference, substituting the unresolved-position marker
/// for nodes missing from `locations`.
fn resolve(refs: impl Iterator<Item = i64>, locations: &HashMap<i64, (i32, i32)>) -> Vec<Coordinate> {
    refs.map(|node_id| match locations.get(&node_id) {
        Some(&(lat, lon)) => Coordinate::new(degrees(lat), degrees(lon)),
        None => Coordinate::new(UNRESOLVED_POSITION, UNRESOLVED_POSITION),
    })
    .collect()
}

fn read_ways(path: &Path, tx: &mpsc::Sender<Result<SourceFeature>>) -> Result<()> {
    let mut locations: HashMap<i64, (i32, i32)> = HashMap::new();
    ElementReader::from_path(path)?.for_each(|element| match element {
        Element::Node(node) => {
            locations.insert(node.id(), (node.decimicro_lat(), node.decimicro_lon()));
        }
        Element::DenseNode(node) => {
            locations.insert(node.id(), (node.decimicro_lat(), node.decimicro_lon()));
        }
        _ => {}
    })?;
    info!(nodes = locations.len(), "indexed node locations");

    let mut receiver_gone = false;
    ElementReader::from_path(path)?.for_each(|element| {
        let Element::Way(way) = element else {
            return;
        };
        if receiver_gone {
            return;
        }

        let coordinates = resolve(way.refs(), &locations);
        let tags: Tags = way
            .tags()
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();

        let feature = SourceFeature {
            id: way.id(),
            coordinates,
            tags,
        };
        receiver_gone = tx.blocking_send(Ok(feature)).is_err();
    })?;

    Ok(())
}
