use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::model::Vec3d;
use crate::nbt::{self, Tag};

use super::WorldError;

/// Read the starting position from `<root>/level.dat`, stored as
/// `/Data/Player/Pos` (a list of three doubles).
pub fn read_spawn_position(world_root: &Path) -> Result<Vec3d, WorldError> {
    let file = File::open(world_root.join("level.dat"))?;
    let level = nbt::read(BufReader::new(file))?;

    match level.lookup("/Data/Player/Pos") {
        Some(Tag::List(items)) => match (items.first(), items.get(1), items.get(2)) {
            (Some(Tag::Double(x)), Some(Tag::Double(y)), Some(Tag::Double(z))) => {
                Ok(Vec3d::new(*x, *y, *z))
            }
            _ => Err(WorldError::MissingTag("/Data/Player/Pos")),
        },
        _ => Err(WorldError::MissingTag("/Data/Player/Pos")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nbt::NamedTag;
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("alphacraft-level-{}-{}", std::process::id(), tag));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_level(root: &Path, pos: Option<[f64; 3]>) {
        let mut player = HashMap::new();
        if let Some([x, y, z]) = pos {
            player.insert(
                "Pos".to_string(),
                Tag::List(vec![Tag::Double(x), Tag::Double(y), Tag::Double(z)]),
            );
        }
        let mut data = HashMap::new();
        data.insert("Player".to_string(), Tag::Compound(player));
        let mut top = HashMap::new();
        top.insert("Data".to_string(), Tag::Compound(data));
        let root_tag = NamedTag {
            name: String::new(),
            tag: Tag::Compound(top),
        };
        nbt::write(File::create(root.join("level.dat")).unwrap(), &root_tag).unwrap();
    }

    #[test]
    fn reads_spawn_position() {
        let dir = temp_dir("ok");
        write_level(&dir, Some([12.5, 64.0, -3.25]));
        let pos = read_spawn_position(&dir).unwrap();
        assert_eq!(pos, Vec3d::new(12.5, 64.0, -3.25));
    }

    #[test]
    fn missing_pos_list_fails() {
        let dir = temp_dir("nopos");
        write_level(&dir, None);
        assert!(matches!(
            read_spawn_position(&dir),
            Err(WorldError::MissingTag(_))
        ));
    }

    #[test]
    fn missing_file_fails() {
        let dir = temp_dir("nofile");
        assert!(matches!(
            read_spawn_position(&dir),
            Err(WorldError::Io(_))
        ));
    }
}
