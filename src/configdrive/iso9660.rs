//! Minimal ISO9660 writer for small provisioning images.
//!
//! Layout: 16 zero sectors, primary volume descriptor, terminator, L and M
//! path tables, directory extents in breadth-first order, then file data.
//! File identifiers keep their case and get the `;1` version suffix.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::errors::{ComputeError, Result};

pub const SECTOR: usize = 2048;

const DESCRIPTOR_LBA: u32 = 16;
const FIRST_FREE_LBA: u32 = 18;
const MAX_IDENTIFIER: usize = 64;

#[derive(Default)]
struct DirNode {
    dirs: BTreeMap<String, DirNode>,
    files: BTreeMap<String, Vec<u8>>,
}

pub struct IsoBuilder {
    volume_id: String,
    root: DirNode,
}

impl IsoBuilder {
    pub fn new(volume_id: &str) -> Result<Self> {
        if volume_id.is_empty() || volume_id.len() > 32 || !volume_id.is_ascii() {
            return Err(ComputeError::Resource(format!("invalid volume label '{}'", volume_id)));
        }
        Ok(Self {
            volume_id: volume_id.to_string(),
            root: DirNode::default(),
        })
    }

    /// Adds a file at a `/`-separated path, creating parent directories.
    pub fn add_file(&mut self, path: &str, data: impl Into<Vec<u8>>) -> Result<()> {
        let parts: Vec<&str> = path.split('/').collect();
        for part in &parts {
            validate_identifier(part, path)?;
        }
        let Some((file_name, dirs)) = parts.split_last() else {
            return Err(ComputeError::Resource("empty file path".to_string()));
        };

        let mut node = &mut self.root;
        for dir in dirs {
            if node.files.contains_key(*dir) {
                return Err(ComputeError::Resource(format!("{} conflicts with an existing file", path)));
            }
            node = node.dirs.entry(dir.to_string()).or_default();
        }
        if node.dirs.contains_key(*file_name) || node.files.contains_key(*file_name) {
            return Err(ComputeError::Resource(format!("{} already exists in image", path)));
        }
        node.files.insert(file_name.to_string(), data.into());
        Ok(())
    }

    pub fn build(&self, now: DateTime<Utc>) -> Result<Vec<u8>> {
        let stamp = record_timestamp(&now);

        let dirs = self.flatten();
        let files: Vec<(usize, &String, &Vec<u8>)> = dirs
            .iter()
            .enumerate()
            .flat_map(|(i, d)| d.node.files.iter().map(move |(name, data)| (i, name, data)))
            .collect();

        // Record lengths do not depend on extents, so sizes can be computed
        // before layout.
        let zero_dirs = vec![(0u32, 0u32); dirs.len()];
        let zero_files = vec![(0u32, 0u32); files.len()];
        let dir_sizes: Vec<usize> = (0..dirs.len())
            .map(|i| pack(&directory_records(&dirs, &files, i, &zero_dirs, &zero_files, &stamp)).len())
            .collect();

        let path_table_size: usize = dirs.iter().map(|d| path_record_len(&d.identifier)).sum();
        let path_table_sectors = sectors(path_table_size).max(1);

        let l_table = FIRST_FREE_LBA;
        let m_table = l_table + path_table_sectors;
        let mut next = m_table + path_table_sectors;

        let mut dir_extents = Vec::with_capacity(dirs.len());
        for size in &dir_sizes {
            dir_extents.push((next, *size as u32));
            next += (size / SECTOR) as u32;
        }
        let mut file_extents = Vec::with_capacity(files.len());
        for (_, _, data) in &files {
            file_extents.push((next, data.len() as u32));
            next += sectors(data.len());
        }
        let total_sectors = next;

        let mut image = vec![0u8; total_sectors as usize * SECTOR];

        let pvd = self.primary_descriptor(&now, total_sectors, path_table_size as u32, l_table, m_table, dir_extents[0], &stamp);
        write_at(&mut image, DESCRIPTOR_LBA, &pvd);
        write_at(&mut image, DESCRIPTOR_LBA + 1, &terminator());
        write_at(&mut image, l_table, &path_table(&dirs, &dir_extents, false));
        write_at(&mut image, m_table, &path_table(&dirs, &dir_extents, true));

        for i in 0..dirs.len() {
            let records = directory_records(&dirs, &files, i, &dir_extents, &file_extents, &stamp);
            write_at(&mut image, dir_extents[i].0, &pack(&records));
        }
        for (i, (_, _, data)) in files.iter().enumerate() {
            write_at(&mut image, file_extents[i].0, data);
        }

        Ok(image)
    }

    fn flatten(&self) -> Vec<FlatDir<'_>> {
        let mut dirs = vec![FlatDir {
            identifier: vec![0],
            parent: 0,
            node: &self.root,
            children: Vec::new(),
        }];
        let mut i = 0;
        while i < dirs.len() {
            let node = dirs[i].node;
            for (name, child) in &node.dirs {
                let index = dirs.len();
                dirs.push(FlatDir {
                    identifier: name.as_bytes().to_vec(),
                    parent: i,
                    node: child,
                    children: Vec::new(),
                });
                dirs[i].children.push((name.clone(), index));
            }
            i += 1;
        }
        dirs
    }

    #[allow(clippy::too_many_arguments)]
    fn primary_descriptor(
        &self,
        now: &DateTime<Utc>,
        total_sectors: u32,
        path_table_size: u32,
        l_table: u32,
        m_table: u32,
        root_extent: (u32, u32),
        stamp: &[u8; 7],
    ) -> Vec<u8> {
        let mut pvd = vec![0u8; SECTOR];
        pvd[0] = 1;
        pvd[1..6].copy_from_slice(b"CD001");
        pvd[6] = 1;
        fill_text(&mut pvd[8..40], "LINUX");
        fill_text(&mut pvd[40..72], &self.volume_id);
        both_u32(&mut pvd[80..88], total_sectors);
        both_u16(&mut pvd[120..124], 1);
        both_u16(&mut pvd[124..128], 1);
        both_u16(&mut pvd[128..132], SECTOR as u16);
        both_u32(&mut pvd[132..140], path_table_size);
        pvd[140..144].copy_from_slice(&l_table.to_le_bytes());
        pvd[148..152].copy_from_slice(&m_table.to_be_bytes());
        pvd[156..190].copy_from_slice(&dir_record(&[0], root_extent.0, root_extent.1, true, stamp));
        fill_text(&mut pvd[190..318], "");
        fill_text(&mut pvd[318..446], "");
        fill_text(&mut pvd[446..574], "");
        fill_text(&mut pvd[574..702], "KVM-COMPUTE");
        fill_text(&mut pvd[702..813], "");
        let created = descriptor_timestamp(Some(now));
        pvd[813..830].copy_from_slice(&created);
        pvd[830..847].copy_from_slice(&created);
        pvd[847..864].copy_from_slice(&descriptor_timestamp(None));
        pvd[864..881].copy_from_slice(&descriptor_timestamp(None));
        pvd[881] = 1;
        pvd
    }
}

struct FlatDir<'a> {
    identifier: Vec<u8>,
    parent: usize,
    node: &'a DirNode,
    children: Vec<(String, usize)>,
}

enum Target {
    Dir(usize),
    File(usize),
}

fn directory_records(
    dirs: &[FlatDir<'_>],
    files: &[(usize, &String, &Vec<u8>)],
    index: usize,
    dir_extents: &[(u32, u32)],
    file_extents: &[(u32, u32)],
    stamp: &[u8; 7],
) -> Vec<Vec<u8>> {
    let dir = &dirs[index];
    let mut entries: Vec<(Vec<u8>, Target)> = dir
        .children
        .iter()
        .map(|(name, child)| (name.as_bytes().to_vec(), Target::Dir(*child)))
        .collect();
    entries.extend(
        files
            .iter()
            .enumerate()
            .filter(|(_, (owner, _, _))| *owner == index)
            .map(|(f, (_, name, _))| (format!("{};1", name).into_bytes(), Target::File(f))),
    );
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let (own_lba, own_len) = dir_extents[index];
    let (parent_lba, parent_len) = dir_extents[dir.parent];
    let mut records = vec![
        dir_record(&[0], own_lba, own_len, true, stamp),
        dir_record(&[1], parent_lba, parent_len, true, stamp),
    ];
    for (identifier, target) in entries {
        let record = match target {
            Target::Dir(d) => dir_record(&identifier, dir_extents[d].0, dir_extents[d].1, true, stamp),
            Target::File(f) => dir_record(&identifier, file_extents[f].0, file_extents[f].1, false, stamp),
        };
        records.push(record);
    }
    records
}

fn dir_record(identifier: &[u8], extent: u32, length: u32, directory: bool, stamp: &[u8; 7]) -> Vec<u8> {
    let padding = if identifier.len() % 2 == 0 { 1 } else { 0 };
    let len = 33 + identifier.len() + padding;
    let mut record = vec![0u8; len];
    record[0] = len as u8;
    both_u32(&mut record[2..10], extent);
    both_u32(&mut record[10..18], length);
    record[18..25].copy_from_slice(stamp);
    record[25] = if directory { 0x02 } else { 0x00 };
    both_u16(&mut record[28..32], 1);
    record[32] = identifier.len() as u8;
    record[33..33 + identifier.len()].copy_from_slice(identifier);
    record
}

/// Concatenates records so none straddles a sector boundary.
fn pack(records: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        let used = out.len() % SECTOR;
        if used + record.len() > SECTOR {
            out.resize(out.len() + SECTOR - used, 0);
        }
        out.extend_from_slice(record);
    }
    let padded = (sectors(out.len()).max(1) as usize) * SECTOR;
    out.resize(padded, 0);
    out
}

fn path_record_len(identifier: &[u8]) -> usize {
    8 + identifier.len() + identifier.len() % 2
}

fn path_table(dirs: &[FlatDir<'_>], extents: &[(u32, u32)], big_endian: bool) -> Vec<u8> {
    let mut table = Vec::new();
    for (i, dir) in dirs.iter().enumerate() {
        let parent_number = (dir.parent + 1) as u16;
        table.push(dir.identifier.len() as u8);
        table.push(0);
        if big_endian {
            table.extend_from_slice(&extents[i].0.to_be_bytes());
            table.extend_from_slice(&parent_number.to_be_bytes());
        } else {
            table.extend_from_slice(&extents[i].0.to_le_bytes());
            table.extend_from_slice(&parent_number.to_le_bytes());
        }
        table.extend_from_slice(&dir.identifier);
        if dir.identifier.len() % 2 == 1 {
            table.push(0);
        }
    }
    table
}

fn terminator() -> Vec<u8> {
    let mut sector = vec![0u8; SECTOR];
    sector[0] = 255;
    sector[1..6].copy_from_slice(b"CD001");
    sector[6] = 1;
    sector
}

fn validate_identifier(part: &str, path: &str) -> Result<()> {
    let valid = !part.is_empty()
        && part.len() <= MAX_IDENTIFIER
        && part != "."
        && part != ".."
        && part.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ComputeError::Resource(format!("invalid path component '{}' in {}", part, path)))
    }
}

fn record_timestamp(now: &DateTime<Utc>) -> [u8; 7] {
    [
        (now.year() - 1900).clamp(0, 255) as u8,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
        0,
    ]
}

fn descriptor_timestamp(now: Option<&DateTime<Utc>>) -> [u8; 17] {
    let mut out = [b'0'; 17];
    out[16] = 0;
    if let Some(now) = now {
        let text = format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}00",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second()
        );
        out[..16].copy_from_slice(&text.as_bytes()[..16]);
    }
    out
}

fn fill_text(field: &mut [u8], text: &str) {
    field.fill(b' ');
    let len = text.len().min(field.len());
    field[..len].copy_from_slice(&text.as_bytes()[..len]);
}

fn both_u32(field: &mut [u8], value: u32) {
    field[..4].copy_from_slice(&value.to_le_bytes());
    field[4..8].copy_from_slice(&value.to_be_bytes());
}

fn both_u16(field: &mut [u8], value: u16) {
    field[..2].copy_from_slice(&value.to_le_bytes());
    field[2..4].copy_from_slice(&value.to_be_bytes());
}

fn sectors(len: usize) -> u32 {
    len.div_ceil(SECTOR) as u32
}

fn write_at(image: &mut [u8], lba: u32, data: &[u8]) {
    let start = lba as usize * SECTOR;
    image[start..start + data.len()].copy_from_slice(data);
}

/// Reads images back for assertions.
#[cfg(test)]
pub(crate) mod reader {
    use super::SECTOR;
    use std::collections::BTreeMap;

    pub fn volume_id(image: &[u8]) -> String {
        let pvd = &image[16 * SECTOR..17 * SECTOR];
        String::from_utf8_lossy(&pvd[40..72]).trim_end().to_string()
    }

    pub fn files(image: &[u8]) -> BTreeMap<String, Vec<u8>> {
        let root = &image[16 * SECTOR + 156..16 * SECTOR + 190];
        let mut out = BTreeMap::new();
        walk(image, le_u32(&root[2..6]), le_u32(&root[10..14]), "", &mut out);
        out
    }

    fn walk(image: &[u8], lba: usize, len: usize, prefix: &str, out: &mut BTreeMap<String, Vec<u8>>) {
        let data = &image[lba * SECTOR..lba * SECTOR + len];
        let mut pos = 0;
        while pos < data.len() {
            let record_len = data[pos] as usize;
            if record_len == 0 {
                pos = (pos / SECTOR + 1) * SECTOR;
                continue;
            }
            let record = &data[pos..pos + record_len];
            let name = &record[33..33 + record[32] as usize];
            if name != [0] && name != [1] {
                let name = String::from_utf8_lossy(name).into_owned();
                let extent = le_u32(&record[2..6]);
                let size = le_u32(&record[10..14]);
                if record[25] & 0x02 != 0 {
                    walk(image, extent, size, &format!("{}{}/", prefix, name), out);
                } else {
                    let name = name.trim_end_matches(";1");
                    out.insert(
                        format!("{}{}", prefix, name),
                        image[extent * SECTOR..extent * SECTOR + size].to_vec(),
                    );
                }
            }
            pos += record_len;
        }
    }

    pub fn le_u32(bytes: &[u8]) -> usize {
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::reader::{files, le_u32, volume_id};
    use super::*;

    #[test]
    fn writes_descriptors_and_files() {
        let mut builder = IsoBuilder::new("cidata").unwrap();
        builder.add_file("meta-data", b"{}".to_vec()).unwrap();
        builder.add_file("user-data", b"#cloud-config\n".to_vec()).unwrap();
        let image = builder.build(Utc::now()).unwrap();

        assert_eq!(image.len() % SECTOR, 0);
        assert!(image[..16 * SECTOR].iter().all(|b| *b == 0));
        assert_eq!(&image[16 * SECTOR + 1..16 * SECTOR + 6], b"CD001");
        assert_eq!(image[17 * SECTOR], 255);
        assert_eq!(volume_id(&image), "cidata");
        assert_eq!(le_u32(&image[16 * SECTOR + 80..16 * SECTOR + 84]) * SECTOR, image.len());

        let tree = files(&image);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree["meta-data"], b"{}");
        assert_eq!(tree["user-data"], b"#cloud-config\n");
    }

    #[test]
    fn nested_directories_appear_in_path_table() {
        let mut builder = IsoBuilder::new("config-2").unwrap();
        builder.add_file("openstack/latest/meta_data.json", b"{\"a\":1}".to_vec()).unwrap();
        builder.add_file("openstack/latest/user_data", Vec::new()).unwrap();
        let image = builder.build(Utc::now()).unwrap();

        let tree = files(&image);
        assert_eq!(tree["openstack/latest/meta_data.json"], b"{\"a\":1}");
        assert!(tree["openstack/latest/user_data"].is_empty());

        // root + openstack + latest
        let pvd = &image[16 * SECTOR..17 * SECTOR];
        let table_size = le_u32(&pvd[132..136]);
        assert_eq!(table_size, path_record_len(&[0]) + path_record_len(b"openstack") + path_record_len(b"latest"));
        let l_table = le_u32(&pvd[140..144]) * SECTOR;
        assert_eq!(image[l_table], 1);
        assert_eq!(&image[l_table + 18..l_table + 27], b"openstack");
    }

    #[test]
    fn large_directories_span_sectors_without_splitting_records() {
        let mut builder = IsoBuilder::new("bulk").unwrap();
        for i in 0..120 {
            let name = format!("file-with-a-fairly-long-name-{:03}", i);
            builder.add_file(&name, name.clone().into_bytes()).unwrap();
        }
        let image = builder.build(Utc::now()).unwrap();
        let tree = files(&image);
        assert_eq!(tree.len(), 120);
        assert_eq!(tree["file-with-a-fairly-long-name-119"], b"file-with-a-fairly-long-name-119");

        let pvd = &image[16 * SECTOR..17 * SECTOR];
        let root_len = le_u32(&pvd[156 + 10..156 + 14]);
        assert!(root_len > SECTOR);
        assert_eq!(root_len % SECTOR, 0);
    }

    #[test]
    fn rejects_bad_paths_and_duplicates() {
        let mut builder = IsoBuilder::new("cidata").unwrap();
        assert!(builder.add_file("", Vec::new()).is_err());
        assert!(builder.add_file("a//b", Vec::new()).is_err());
        assert!(builder.add_file("../etc", Vec::new()).is_err());
        assert!(builder.add_file("sp ace", Vec::new()).is_err());

        builder.add_file("dir/file", Vec::new()).unwrap();
        assert!(matches!(builder.add_file("dir/file", Vec::new()), Err(ComputeError::Resource(_))));
        assert!(builder.add_file("dir", Vec::new()).is_err());
        assert!(builder.add_file("dir/file/child", Vec::new()).is_err());
    }

    #[test]
    fn rejects_long_labels() {
        assert!(IsoBuilder::new(&"x".repeat(33)).is_err());
        assert!(IsoBuilder::new("").is_err());
    }
}
