//! Command line tool for building and querying navigation meshes

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use glam::Vec3;
use log::info;
use std::path::{Path, PathBuf};

use navforge_common::InputGeometry;
use navforge_detour::{
    DefaultQueryFilter, NavMesh, NavMeshBuildConfig, NavMeshBuilder, NavMeshQuery, NavMeshSerializer,
    StraightPathFlags, TiledNavMeshBuilder,
};
use navforge_recast::RecastConfig;

/// Half extents of the box searched around start and end points
const SEARCH_EXTENTS: [f32; 3] = [2.0, 4.0, 2.0];

const MAX_PATH: usize = 2048;
const MAX_STRAIGHT_PATH: usize = 256;

/// Build navigation meshes from OBJ geometry and run path queries on them
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a navigation mesh from an OBJ file
    Build {
        /// Input mesh (OBJ)
        #[clap(long, value_parser)]
        input: PathBuf,

        /// Output navigation mesh file
        #[clap(long, value_parser)]
        output: PathBuf,

        /// Split the mesh into square tiles
        #[clap(long)]
        tiled: bool,

        /// Tile edge length in cells
        #[clap(long, default_value = "32")]
        tile_size: i32,

        /// Cell size (horizontal resolution) in world units
        #[clap(long, default_value = "0.3")]
        cs: f32,

        /// Cell height (vertical resolution) in world units
        #[clap(long, default_value = "0.2")]
        ch: f32,

        /// Agent height in world units
        #[clap(long, default_value = "2.0")]
        walkable_height: f32,

        /// Largest step an agent can climb in world units
        #[clap(long, default_value = "0.9")]
        walkable_climb: f32,

        /// Agent radius in world units
        #[clap(long, default_value = "0.6")]
        walkable_radius: f32,

        /// Steepest walkable slope in degrees
        #[clap(long, default_value = "45.0")]
        walkable_slope_angle: f32,
    },

    /// Print tile, polygon and vertex counts of a navigation mesh
    Info {
        /// Navigation mesh file
        #[clap(long, value_parser)]
        mesh: PathBuf,
    },

    /// Find a path on a navigation mesh
    FindPath {
        /// Navigation mesh file
        #[clap(long, value_parser)]
        mesh: PathBuf,

        /// Start position (x,y,z)
        #[clap(long, value_parser = parse_vector, allow_hyphen_values = true)]
        start: Vec3,

        /// End position (x,y,z)
        #[clap(long, value_parser = parse_vector, allow_hyphen_values = true)]
        end: Vec3,
    },
}

/// Parse a comma-separated vector
fn parse_vector(s: &str) -> Result<Vec3, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return Err(format!("Vector must have 3 components, got {}", parts.len()));
    }
    let mut v = [0.0f32; 3];
    for (dst, part) in v.iter_mut().zip(&parts) {
        *dst = part.parse::<f32>().map_err(|e| format!("{part:?}: {e}"))?;
    }
    Ok(Vec3::from_array(v))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Commands::Build {
            input,
            output,
            tiled,
            tile_size,
            cs,
            ch,
            walkable_height,
            walkable_climb,
            walkable_radius,
            walkable_slope_angle,
        } => {
            let config = NavMeshBuildConfig {
                cell_size: cs,
                cell_height: ch,
                walkable_height,
                walkable_climb,
                walkable_radius,
                walkable_slope_angle,
                tile_size,
                ..Default::default()
            };
            build_mesh(&input, &output, &config, tiled)
        }
        Commands::Info { mesh } => show_info(&mesh),
        Commands::FindPath { mesh, start, end } => find_path(&mesh, start, end),
    }
}

fn build_mesh(input: &Path, output: &Path, config: &NavMeshBuildConfig, tiled: bool) -> Result<()> {
    let geometry = InputGeometry::from_obj(input)
        .with_context(|| format!("Failed to load mesh from {}", input.display()))?;
    info!(
        "Loaded {}: {} vertices, {} triangles",
        input.display(),
        geometry.vertex_count(),
        geometry.triangle_count()
    );
    if geometry.is_empty() {
        bail!("{} contains no triangles", input.display());
    }

    let (bmin, bmax) = (geometry.bmin(), geometry.bmax());
    let grid: RecastConfig = config.to_recast_config(bmin, bmax, 0);
    grid.validate().map_err(|e| anyhow!("Invalid build settings: {e}"))?;
    info!("Bounds {bmin} .. {bmax}, grid {}x{} cells", grid.width, grid.height);

    let nav_mesh = if tiled {
        let mut builder = TiledNavMeshBuilder::new();
        builder
            .initialize(bmin.into(), bmax.into(), config)
            .map_err(|e| anyhow!("Failed to set up tiles: {e}"))?;
        let result = builder.build_all(&geometry);
        if !result.success {
            bail!(
                "Tiled build failed: {}",
                result.error_message.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        info!(
            "Built {} of {} tiles ({}x{}), {} polygons",
            result.tile_count, result.total_tiles_attempted, result.tile_count_x, result.tile_count_z, result.total_poly_count
        );
        result.nav_mesh.ok_or_else(|| anyhow!("Tiled build returned no mesh"))?
    } else {
        let result = NavMeshBuilder::build_single(&geometry, config);
        if !result.success {
            bail!(
                "Build failed: {}",
                result.error_message.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        info!(
            "Built {} polygons, {} vertices, {} detail triangles",
            result.stats.poly_count, result.stats.vertex_count, result.stats.detail_triangle_count
        );
        result.nav_mesh.ok_or_else(|| anyhow!("Build returned no mesh"))?
    };

    NavMeshSerializer::save_to_file(&nav_mesh, output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Saved {} tiles with {} polygons to {}",
        nav_mesh.tile_count(),
        nav_mesh.total_poly_count(),
        output.display()
    );
    Ok(())
}

fn load_mesh(path: &Path) -> Result<NavMesh> {
    NavMeshSerializer::load_from_file(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn show_info(path: &Path) -> Result<()> {
    let nav_mesh = load_mesh(path)?;
    let params = nav_mesh.params();
    println!("{}", path.display());
    println!(
        "  origin {:?}, tile size {} x {}, max tiles {}",
        params.origin, params.tile_width, params.tile_height, params.max_tiles
    );
    println!("  tiles: {}", nav_mesh.tile_count());

    let mut polys = 0;
    let mut verts = 0;
    let mut off_mesh = 0;
    for (index, tile) in nav_mesh.tiles() {
        println!(
            "  tile {index} at ({}, {}): {} polygons, {} vertices, {} links",
            tile.header.x,
            tile.header.z,
            tile.poly_count(),
            tile.vertex_count(),
            tile.link_count()
        );
        polys += tile.poly_count();
        verts += tile.vertex_count();
        off_mesh += tile.off_mesh_links.len();
    }
    println!("  total: {polys} polygons, {verts} vertices, {off_mesh} off-mesh connections");
    Ok(())
}

fn find_path(path: &Path, start: Vec3, end: Vec3) -> Result<()> {
    let nav_mesh = load_mesh(path)?;
    let filter = DefaultQueryFilter::default();
    let mut query = NavMeshQuery::new(&nav_mesh);

    let (start_ref, start_pos) = query
        .find_nearest_poly(&start.to_array(), &SEARCH_EXTENTS, &filter)
        .map_err(|e| anyhow!("No polygon near start {start}: {e}"))?;
    let (end_ref, end_pos) = query
        .find_nearest_poly(&end.to_array(), &SEARCH_EXTENTS, &filter)
        .map_err(|e| anyhow!("No polygon near end {end}: {e}"))?;

    let found = query
        .find_path(start_ref, end_ref, &start_pos, &end_pos, &filter, MAX_PATH)
        .map_err(|e| anyhow!("Path search failed: {e}"))?;
    if found.is_partial() {
        println!("Partial path: the end point is not reachable");
    }
    let refs: Vec<String> = found.path.iter().map(|r| r.to_string()).collect();
    println!("Polygons ({}): {}", refs.len(), refs.join(" "));

    let straight = query
        .find_straight_path(&start_pos, &end_pos, &found.path, MAX_STRAIGHT_PATH)
        .map_err(|e| anyhow!("String pulling failed: {e}"))?;
    println!("Waypoints ({}):", straight.len());
    for i in 0..straight.len() {
        let p = straight.point(i);
        let tag = if straight.flags[i].contains(StraightPathFlags::OFFMESH_CONNECTION) {
            " (off-mesh)"
        } else {
            ""
        };
        println!("  {i}: {:.3},{:.3},{:.3}{tag}", p[0], p[1], p[2]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;

    #[test]
    fn test_parse_vector() {
        assert_eq!(parse_vector("1,2.5,-3").unwrap(), Vec3::new(1.0, 2.5, -3.0));
        assert_eq!(parse_vector(" 0, 0 ,0").unwrap(), Vec3::ZERO);
        assert!(parse_vector("1,2").is_err());
        assert!(parse_vector("a,b,c").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let args = Args::try_parse_from([
            "navforge", "find-path", "--mesh", "m.nav", "--start", "-1,0,2", "--end", "3,0,-4",
        ])
        .unwrap();
        match args.command {
            Commands::FindPath { start, end, .. } => {
                assert_eq!(start, Vec3::new(-1.0, 0.0, 2.0));
                assert_eq!(end, Vec3::new(3.0, 0.0, -4.0));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let args = Args::try_parse_from(["navforge", "build", "--input", "a.obj", "--output", "a.nav", "--tiled"]).unwrap();
        assert!(matches!(args.command, Commands::Build { tiled: true, tile_size: 32, .. }));
    }

    #[test]
    fn test_build_info_and_find_path() {
        let dir = tempfile::tempdir().unwrap();
        let obj = dir.path().join("plane.obj");
        let nav = dir.path().join("plane.nav");

        let mut content = String::new();
        for (x, z) in [(-5, -5), (-5, 5), (5, 5), (5, -5)] {
            writeln!(content, "v {x} 0 {z}").unwrap();
        }
        content.push_str("f 1 2 3\nf 1 3 4\n");
        std::fs::write(&obj, content).unwrap();

        build_mesh(&obj, &nav, &NavMeshBuildConfig::default(), false).unwrap();
        show_info(&nav).unwrap();
        find_path(&nav, Vec3::new(-3.0, 0.0, -3.0), Vec3::new(3.0, 0.0, 3.0)).unwrap();

        let loaded = load_mesh(&nav).unwrap();
        assert_eq!(loaded.tile_count(), 1);

        let tiled = dir.path().join("tiled.nav");
        build_mesh(&obj, &tiled, &NavMeshBuildConfig::default(), true).unwrap();
        assert!(load_mesh(&tiled).unwrap().tile_count() >= 1);

        assert!(build_mesh(&dir.path().join("missing.obj"), &nav, &NavMeshBuildConfig::default(), false).is_err());
    }
}
