//! Map persistence.
//!
//! A map file is an ASCII header followed by a binary body. The header is
//! a sequence of newline-terminated `token value` lines, in any order,
//! terminated by a line reading `data`; lines starting with `#` are
//! comments. The body encodes the tree recursively from the root: one mask
//! byte telling which children have children of their own (`0x00` marks a
//! collapsed subtree, whose single leaf record follows), then the
//! intersecting children in index order. The body can be LZ4-compressed
//! and clipped to a bounding volume.

use crate::error::MapError;
use crate::geometry::{Aabb, BoundingVolume};
use crate::layout::{child_center, TreeLayout};
use crate::node::{InnerNode, NodeCounts, OccupancyNode};
use crate::sensor_model::SensorModel;
use crate::tree::OccupancyMap;

use nalgebra::Point3;

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// First line of every map file. Changing it breaks compatibility with
/// every reader in existence.
pub const FILE_HEADER: &str = "# UFOMap octree file";

/// Format version written to the `version` header token.
pub const FILE_VERSION: &str = "1.0.0";

/// How leaves are encoded in the file body. This is the extension seam for
/// tree variants carrying extra per-leaf data: implement it, give the tree
/// type a distinct `id`, and the engine handles the rest of the format.
pub trait LeafCodec {
    /// Identifier written to, and checked against, the `id` header token.
    fn tree_type(&self) -> &str;

    /// Whether the codec defines the compact binary node layout. Files
    /// with `binary 1` are rejected unless this is `true`.
    fn binary_support(&self) -> bool {
        false
    }

    fn write_leaf(&self, writer: &mut dyn Write, leaf: &OccupancyNode) -> io::Result<()>;

    fn read_leaf(&self, reader: &mut dyn Read, leaf: &mut OccupancyNode) -> io::Result<()>;
}

/// The default leaf encoding: the occupancy log-odds as a little-endian
/// IEEE-754 32-bit float. No binary mode.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardCodec;

impl LeafCodec for StandardCodec {
    fn tree_type(&self) -> &str {
        "occupancy_map"
    }

    fn write_leaf(&self, writer: &mut dyn Write, leaf: &OccupancyNode) -> io::Result<()> {
        writer.write_all(&leaf.logit().to_le_bytes())
    }

    fn read_leaf(&self, reader: &mut dyn Read, leaf: &mut OccupancyNode) -> io::Result<()> {
        let mut bytes = [0u8; 4];
        reader.read_exact(&mut bytes)?;
        leaf.set_logit(f32::from_le_bytes(bytes));
        Ok(())
    }
}

/// Options for [`OccupancyMap::write`].
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    /// Only write subtrees intersecting this volume; empty writes
    /// everything.
    pub bounding_volume: BoundingVolume,
    /// LZ4-compress the body.
    pub compress: bool,
    /// Use the codec's binary node layout.
    pub binary: bool,
    /// Write subtrees below this depth as single summary leaves.
    pub min_depth: u8,
}

#[derive(Debug)]
struct Header {
    version: String,
    id: String,
    binary: bool,
    resolution: f64,
    depth_levels: u8,
    occupancy_thres: f32,
    free_thres: f32,
    compressed: bool,
    uncompressed_data_size: i64,
}

impl<C: LeafCodec> OccupancyMap<C> {
    /// Serialises the map. The tree shape is preserved exactly when no
    /// bounding volume and no `min_depth` are given.
    pub fn write<W: Write>(&self, mut writer: W, options: &WriteOptions) -> Result<(), MapError> {
        if options.binary && !self.codec.binary_support() {
            return Err(MapError::Format(format!(
                "tree type '{}' has no binary encoding",
                self.codec.tree_type()
            )));
        }

        let mut body = Vec::new();
        self.write_root(&mut body, &options.bounding_volume, options.min_depth)?;
        let uncompressed_data_size = body.len();
        let body = if options.compress {
            compress_lz4(&body)?
        } else {
            body
        };

        writeln!(writer, "{}", FILE_HEADER)?;
        writeln!(
            writer,
            "# (feel free to add / change comments, but leave the first line as it is!)\n#"
        )?;
        writeln!(writer, "version {}", FILE_VERSION)?;
        writeln!(writer, "id {}", self.codec.tree_type())?;
        writeln!(writer, "binary {}", options.binary as u8)?;
        writeln!(writer, "resolution {}", self.resolution())?;
        writeln!(writer, "depth_levels {}", self.depth_levels())?;
        writeln!(writer, "occupancy_thres {}", self.occupancy_thres())?;
        writeln!(writer, "free_thres {}", self.free_thres())?;
        writeln!(writer, "compressed {}", options.compress as u8)?;
        writeln!(writer, "uncompressed_data_size {}", uncompressed_data_size)?;
        writeln!(writer, "data")?;
        writer.write_all(&body)?;

        Ok(())
    }

    pub fn write_file<P: AsRef<Path>>(
        &self,
        path: P,
        options: &WriteOptions,
    ) -> Result<(), MapError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write(&mut writer, options)?;
        writer.flush()?;
        Ok(())
    }

    /// Deserialises a map. When the file's resolution or depth levels
    /// differ from the current parameters the tree is cleared and
    /// re-initialised first. A rejected header leaves the tree untouched;
    /// a failing body leaves it cleared.
    pub fn read<R: BufRead>(&mut self, reader: R) -> Result<(), MapError> {
        self.read_bounded(reader, &BoundingVolume::new())
    }

    /// [`read`](Self::read) of a file written with a bounding volume. The
    /// body only holds records for subtrees intersecting the volume, so
    /// the reader must apply the same one to stay in step with it.
    pub fn read_bounded<R: BufRead>(
        &mut self,
        mut reader: R,
        volume: &BoundingVolume,
    ) -> Result<(), MapError> {
        let mut first_line = String::new();
        reader.read_line(&mut first_line)?;
        if !first_line.starts_with(FILE_HEADER) {
            return Err(MapError::Format(format!(
                "first line must be '{}'",
                FILE_HEADER
            )));
        }

        let header = read_header(&mut reader, &self.codec)?;

        if header.resolution != self.resolution() || header.depth_levels != self.depth_levels() {
            log::warn!(
                "file geometry ({} m, {} levels) differs from the map ({} m, {} levels); clearing",
                header.resolution,
                header.depth_levels,
                self.resolution(),
                self.depth_levels()
            );
            self.clear_with(header.resolution, header.depth_levels)?;
        }

        let result = if header.compressed {
            let mut compressed = Vec::new();
            reader.read_to_end(&mut compressed)?;
            decompress_lz4(&compressed, header.uncompressed_data_size as usize)
                .and_then(|body| self.read_root(&mut body.as_slice(), volume))
        } else {
            self.read_root(&mut reader, volume)
        };

        if result.is_err() {
            self.clear();
        }
        result
    }

    pub fn read_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), MapError> {
        self.read(BufReader::new(File::open(path)?))
    }

    fn write_root(
        &self,
        writer: &mut Vec<u8>,
        volume: &BoundingVolume,
        min_depth: u8,
    ) -> Result<(), MapError> {
        let depth = self.depth_levels();
        let center = Point3::origin();
        if !volume.intersects(&Aabb::cube(center, self.node_half_size(depth))) {
            return Ok(());
        }

        let mask: u8 = if self.root.has_children() && depth > min_depth {
            0xFF
        } else {
            0x00
        };
        writer.push(mask);

        if mask == 0 {
            self.codec.write_leaf(writer, &self.root.node)?;
            return Ok(());
        }
        self.write_nodes_recurs(writer, volume, &self.root, center, depth, min_depth)
    }

    fn write_nodes_recurs(
        &self,
        writer: &mut Vec<u8>,
        volume: &BoundingVolume,
        node: &InnerNode,
        center: Point3<f64>,
        current_depth: u8,
        min_depth: u8,
    ) -> Result<(), MapError> {
        let child_depth = current_depth - 1;
        let child_half_size = self.node_half_size(child_depth);
        let children = node.inner_children();

        // 1 bit per child; 0: leaf record follows, 1: the child recursed.
        let mut mask: u8 = 0;
        let mut intersects = [false; 8];
        let mut centers = [Point3::origin(); 8];
        for (index, child) in children.iter().enumerate() {
            centers[index] = child_center(&center, child_half_size, index);
            intersects[index] = volume.intersects(&Aabb::cube(centers[index], child_half_size));
            if intersects[index] && child.has_children() && child_depth > min_depth {
                mask |= 1 << index;
            }
        }
        writer.push(mask);

        for (index, child) in children.iter().enumerate() {
            if !intersects[index] {
                continue;
            }
            if mask & (1 << index) != 0 {
                if child_depth == 1 {
                    let leaf_half_size = self.node_half_size(0);
                    for (leaf_index, leaf) in child.leaf_children().iter().enumerate() {
                        let leaf_aabb = Aabb::cube(
                            child_center(&centers[index], leaf_half_size, leaf_index),
                            leaf_half_size,
                        );
                        if volume.intersects(&leaf_aabb) {
                            self.codec.write_leaf(writer, leaf)?;
                        }
                    }
                } else {
                    self.write_nodes_recurs(
                        writer,
                        volume,
                        child,
                        centers[index],
                        child_depth,
                        min_depth,
                    )?;
                }
            } else {
                self.codec.write_leaf(writer, &child.node)?;
            }
        }

        Ok(())
    }

    fn read_root(&mut self, reader: &mut dyn Read, volume: &BoundingVolume) -> Result<(), MapError> {
        let Self {
            codec,
            layout,
            model,
            root,
            counts,
            automatic_pruning,
            ..
        } = self;

        let depth = layout.depth_levels();
        let center = Point3::origin();
        if !volume.intersects(&Aabb::cube(center, layout.node_half_size(depth))) {
            return Ok(());
        }

        let mut mask = [0u8; 1];
        reader.read_exact(&mut mask)?;

        if mask[0] == 0 {
            codec.read_leaf(reader, &mut root.node)?;
            root.prune(depth, true, *automatic_pruning, model, counts);
            return Ok(());
        }

        let ctx = ReadCtx {
            codec: &*codec,
            layout: &*layout,
            model: &*model,
            auto_prune: *automatic_pruning,
        };
        read_nodes_recurs(&ctx, counts, reader, volume, root, center, depth)?;
        drop(ctx);
        root.update_from_children(depth, *automatic_pruning, model, counts);
        Ok(())
    }
}

struct ReadCtx<'a, C: LeafCodec> {
    codec: &'a C,
    layout: &'a TreeLayout,
    model: &'a SensorModel,
    auto_prune: bool,
}

fn read_nodes_recurs<C: LeafCodec>(
    ctx: &ReadCtx<'_, C>,
    counts: &mut NodeCounts,
    reader: &mut dyn Read,
    volume: &BoundingVolume,
    node: &mut InnerNode,
    center: Point3<f64>,
    current_depth: u8,
) -> Result<(), MapError> {
    let child_depth = current_depth - 1;
    let child_half_size = ctx.layout.node_half_size(child_depth);

    let mut mask = [0u8; 1];
    reader.read_exact(&mut mask)?;
    let mask = mask[0];

    node.expand(current_depth, counts);

    for index in 0..8 {
        let child_center_point = child_center(&center, child_half_size, index);
        // Records only exist for children the writer found intersecting,
        // so the reader has to test the exact same boxes.
        if !volume.intersects(&Aabb::cube(child_center_point, child_half_size)) {
            continue;
        }

        let child = &mut node.inner_children_mut()[index];
        if mask & (1 << index) != 0 {
            if child_depth == 1 {
                child.expand(1, counts);
                let leaf_half_size = ctx.layout.node_half_size(0);
                for (leaf_index, leaf) in child.leaf_children_mut().iter_mut().enumerate() {
                    let leaf_aabb = Aabb::cube(
                        child_center(&child_center_point, leaf_half_size, leaf_index),
                        leaf_half_size,
                    );
                    if volume.intersects(&leaf_aabb) {
                        ctx.codec.read_leaf(reader, leaf)?;
                    }
                }
            } else {
                read_nodes_recurs(
                    ctx,
                    counts,
                    reader,
                    volume,
                    child,
                    child_center_point,
                    child_depth,
                )?;
            }
            child.update_from_children(child_depth, ctx.auto_prune, ctx.model, counts);
        } else {
            ctx.codec.read_leaf(reader, &mut child.node)?;
            child.prune(child_depth, true, ctx.auto_prune, ctx.model, counts);
        }
    }

    Ok(())
}

fn read_header<R: BufRead, C: LeafCodec>(reader: &mut R, codec: &C) -> Result<Header, MapError> {
    let mut header = Header {
        version: String::new(),
        id: String::new(),
        binary: false,
        resolution: 0.0,
        depth_levels: 0,
        occupancy_thres: -1.0,
        free_thres: -1.0,
        compressed: false,
        uncompressed_data_size: -1,
    };

    let mut line = String::new();
    let mut header_read = false;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }

        let mut tokens = line.split_whitespace();
        let Some(token) = tokens.next() else {
            continue;
        };
        if token.starts_with('#') {
            continue;
        }
        if token == "data" {
            header_read = true;
            break;
        }

        let value = tokens.next().unwrap_or("");
        match token {
            "version" => header.version = value.to_string(),
            "id" => header.id = value.to_string(),
            "binary" => header.binary = parse_header_value::<u8>("binary", value)? != 0,
            "resolution" => header.resolution = parse_header_value("resolution", value)?,
            "depth_levels" => header.depth_levels = parse_header_value("depth_levels", value)?,
            "occupancy_thres" => {
                header.occupancy_thres = parse_header_value("occupancy_thres", value)?
            }
            "free_thres" => header.free_thres = parse_header_value("free_thres", value)?,
            "compressed" => header.compressed = parse_header_value::<u8>("compressed", value)? != 0,
            "uncompressed_data_size" => {
                header.uncompressed_data_size =
                    parse_header_value("uncompressed_data_size", value)?
            }
            _ => {} // Unknown token; skip the line.
        }
    }

    if !header_read {
        return Err(MapError::Format("missing 'data' line".to_string()));
    }
    if header.version.is_empty() {
        return Err(MapError::Format("missing 'version' token".to_string()));
    }
    if header.id.is_empty() {
        return Err(MapError::Format("missing 'id' token".to_string()));
    }
    if header.binary && !codec.binary_support() {
        return Err(MapError::Format(format!(
            "file is binary but tree type '{}' has no binary encoding",
            codec.tree_type()
        )));
    }
    if header.resolution <= 0.0 {
        return Err(MapError::Format(format!(
            "resolution must be positive, got {}",
            header.resolution
        )));
    }
    if header.depth_levels == 0 {
        return Err(MapError::Format("missing 'depth_levels' token".to_string()));
    }
    if header.occupancy_thres < 0.0 {
        return Err(MapError::Format(
            "missing 'occupancy_thres' token".to_string(),
        ));
    }
    if header.free_thres < 0.0 {
        return Err(MapError::Format("missing 'free_thres' token".to_string()));
    }
    if header.uncompressed_data_size < 0 {
        return Err(MapError::Format(
            "missing 'uncompressed_data_size' token".to_string(),
        ));
    }
    if header.id != codec.tree_type() {
        return Err(MapError::Format(format!(
            "file holds tree type '{}', expected '{}'",
            header.id,
            codec.tree_type()
        )));
    }

    Ok(header)
}

fn parse_header_value<T: std::str::FromStr>(token: &str, value: &str) -> Result<T, MapError> {
    value
        .parse()
        .map_err(|_| MapError::Format(format!("malformed '{}' value: '{}'", token, value)))
}

fn compress_lz4(data: &[u8]) -> Result<Vec<u8>, MapError> {
    let mut encoder = lz4::EncoderBuilder::new().build(Vec::new())?;
    encoder.write_all(data)?;
    let (compressed, result) = encoder.finish();
    result?;
    Ok(compressed)
}

fn decompress_lz4(compressed: &[u8], uncompressed_data_size: usize) -> Result<Vec<u8>, MapError> {
    let mut decoder = lz4::Decoder::new(compressed)?;
    let mut data = Vec::with_capacity(uncompressed_data_size);
    decoder.read_to_end(&mut data)?;
    if data.len() != uncompressed_data_size {
        return Err(MapError::Format(format!(
            "inconsistent uncompressed_data_size: header says {}, body decodes to {}",
            uncompressed_data_size,
            data.len()
        )));
    }
    Ok(data)
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MapOptions;

    use nalgebra::Point3;

    fn ray_map() -> OccupancyMap {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        map.insert_ray(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.35, 0.0, 0.0),
            None,
            0,
        );
        map
    }

    fn classify(map: &OccupancyMap, x: f64) -> (bool, bool, bool) {
        let p = Point3::new(x, 0.0, 0.0);
        (
            map.is_occupied_at(&p, 0),
            map.is_free_at(&p, 0),
            map.is_unknown_at(&p, 0),
        )
    }

    #[test]
    fn round_trip_preserves_classification_and_counts() {
        let map = ray_map();

        let mut bytes = Vec::new();
        map.write(&mut bytes, &WriteOptions::default()).unwrap();

        let mut restored = OccupancyMap::new(MapOptions::default()).unwrap();
        restored.read(bytes.as_slice()).unwrap();

        for x in [0.05, 0.15, 0.25, 0.35, 1.0, -4.2] {
            assert_eq!(classify(&map, x), classify(&restored, x), "at x = {}", x);
        }
        assert_eq!(map.num_inner_nodes(), restored.num_inner_nodes());
        assert_eq!(map.num_inner_leaf_nodes(), restored.num_inner_leaf_nodes());
        assert_eq!(map.num_leaf_nodes(), restored.num_leaf_nodes());
    }

    #[test]
    fn compressed_round_trip_matches_uncompressed() {
        let map = ray_map();

        let mut plain = Vec::new();
        map.write(&mut plain, &WriteOptions::default()).unwrap();

        let mut compressed = Vec::new();
        map.write(
            &mut compressed,
            &WriteOptions {
                compress: true,
                ..Default::default()
            },
        )
        .unwrap();

        let mut from_plain = OccupancyMap::new(MapOptions::default()).unwrap();
        from_plain.read(plain.as_slice()).unwrap();
        let mut from_compressed = OccupancyMap::new(MapOptions::default()).unwrap();
        from_compressed.read(compressed.as_slice()).unwrap();

        for x in [0.05, 0.15, 0.25, 0.35] {
            assert_eq!(classify(&from_plain, x), classify(&from_compressed, x));
        }
        assert_eq!(from_plain.size(), from_compressed.size());
    }

    #[test]
    fn reader_tolerates_comments_and_unknown_tokens() {
        let map = ray_map();
        let mut bytes = Vec::new();
        map.write(&mut bytes, &WriteOptions::default()).unwrap();

        // Inject noise between the first line and the rest of the header.
        let split = bytes.iter().position(|&b| b == b'\n').unwrap() + 1;
        let mut noisy = bytes[..split].to_vec();
        noisy.extend_from_slice(b"# a comment line\nfuture_token 42\n");
        noisy.extend_from_slice(&bytes[split..]);

        let mut restored = OccupancyMap::new(MapOptions::default()).unwrap();
        restored.read(noisy.as_slice()).unwrap();
        assert_eq!(restored.size(), map.size());
    }

    #[test]
    fn wrong_tree_type_is_rejected_without_touching_the_tree() {
        let map = ray_map();
        let mut bytes = Vec::new();
        map.write(&mut bytes, &WriteOptions::default()).unwrap();

        let text = String::from_utf8_lossy(&bytes).replace("id occupancy_map", "id color_map");

        let mut target = ray_map();
        let size_before = target.size();
        let result = target.read(text.as_bytes());

        assert!(matches!(result, Err(MapError::Format(_))));
        assert_eq!(target.size(), size_before);
    }

    #[test]
    fn truncated_body_leaves_the_tree_cleared() {
        let map = ray_map();
        let mut bytes = Vec::new();
        map.write(&mut bytes, &WriteOptions::default()).unwrap();
        bytes.truncate(bytes.len() - 3);

        let mut restored = OccupancyMap::new(MapOptions::default()).unwrap();
        assert!(restored.read(bytes.as_slice()).is_err());
        assert_eq!(restored.size(), 1);
        assert!(restored.is_unknown_at(&Point3::new(0.35, 0.0, 0.0), 0));
    }

    #[test]
    fn mismatched_geometry_reinitialises_the_tree() {
        let map = ray_map();
        let mut bytes = Vec::new();
        map.write(&mut bytes, &WriteOptions::default()).unwrap();

        let mut restored = OccupancyMap::new(MapOptions {
            resolution: 0.25,
            depth_levels: 14,
            ..Default::default()
        })
        .unwrap();
        restored.read(bytes.as_slice()).unwrap();

        assert_eq!(restored.resolution(), 0.1);
        assert_eq!(restored.depth_levels(), 16);
        assert!(restored.is_occupied_at(&Point3::new(0.35, 0.0, 0.0), 0));
    }

    #[test]
    fn bounded_write_clips_to_the_volume() {
        let map = ray_map();

        let around_hit =
            Aabb::from_min_max(Point3::new(0.3, -0.04, -0.04), Point3::new(0.4, 0.04, 0.04));
        let volume = BoundingVolume::from(around_hit);
        let mut bytes = Vec::new();
        map.write(
            &mut bytes,
            &WriteOptions {
                bounding_volume: volume.clone(),
                ..Default::default()
            },
        )
        .unwrap();

        // A clipped body only holds records for the volume, so the reader
        // has to apply the same clip.
        let mut restored = OccupancyMap::new(MapOptions::default()).unwrap();
        restored.read_bounded(bytes.as_slice(), &volume).unwrap();

        assert!(restored.is_occupied_at(&Point3::new(0.35, 0.0, 0.0), 0));
        assert!(restored.is_unknown_at(&Point3::new(0.05, 0.0, 0.0), 0));
    }

    #[test]
    fn binary_write_is_rejected_by_the_standard_codec() {
        let map = ray_map();
        let mut bytes = Vec::new();
        let result = map.write(
            &mut bytes,
            &WriteOptions {
                binary: true,
                ..Default::default()
            },
        );

        assert!(matches!(result, Err(MapError::Format(_))));
    }

    #[test]
    fn lz4_round_trip() {
        let data: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();
        let compressed = compress_lz4(&data).unwrap();
        assert!(compressed.len() < data.len());

        let decompressed = decompress_lz4(&compressed, data.len()).unwrap();
        assert_eq!(data, decompressed);

        assert!(matches!(
            decompress_lz4(&compressed, data.len() + 1),
            Err(MapError::Format(_))
        ));
    }
}
