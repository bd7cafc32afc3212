use sleipnir::comm::LocalComm;
use sleipnir::gather::{DofCorrespondence, GatherOp, GatherScatter};
use sleipnir::procedural::{unit_square_quad_mesh, unit_square_triangle_mesh};

#[test]
fn dof_correspondence_is_a_bijection_on_two_triangles_sharing_an_edge() {
    // One grid cell split into two triangles: the diagonal nodes are duplicated.
    let mesh = unit_square_triangle_mesh::<f64>(1, 1, false);
    let dofs = DofCorrespondence::from_global_ids(&mesh.partition.global_node_ids).unwrap();

    assert_eq!(dofs.num_local(), 6);
    assert_eq!(dofs.num_gathered(), 4);

    // Every local slot maps to exactly one gathered dof...
    for slot in 0..dofs.num_local() {
        assert!(dofs.gathered_of(slot) < dofs.num_gathered());
    }
    // ...and every gathered dof has at least one local image; the two diagonal nodes
    // have exactly two.
    let mut total_images = 0;
    for dof in 0..dofs.num_gathered() {
        let images = dofs.duplicates(dof).len();
        assert!(images >= 1);
        total_images += images;
    }
    assert_eq!(total_images, dofs.num_local());
    assert_eq!(dofs.duplicates(dofs.find(1).unwrap()).len(), 2);
    assert_eq!(dofs.duplicates(dofs.find(2).unwrap()).len(), 2);
}

#[test]
fn gather_sums_four_contributions_at_the_center_of_four_quads() {
    let mesh = unit_square_quad_mesh::<f64>(2, 2, 1, false);
    let comm = LocalComm;
    let gs = GatherScatter::new(&mesh.partition, &comm).unwrap();
    assert_eq!(gs.num_gathered(), 9);

    let local = vec![1.0; gs.num_local()];
    let mut gathered = vec![0.0; gs.num_gathered()];
    gs.gather(&mut gathered, &local, 1, GatherOp::Add, &comm)
        .unwrap();

    let dofs = gs.correspondence();
    // Node 4 is the center of the 3x3 grid and belongs to all four elements.
    assert_eq!(gathered[dofs.find(4).unwrap()], 4.0);
    // Corners belong to one element, edge midpoints to two.
    assert_eq!(gathered[dofs.find(0).unwrap()], 1.0);
    assert_eq!(gathered[dofs.find(1).unwrap()], 2.0);
}

#[test]
fn scatter_then_gather_sums_duplicates_and_pre_division_restores_the_field() {
    let mesh = unit_square_quad_mesh::<f64>(2, 2, 1, false);
    let comm = LocalComm;
    let gs = GatherScatter::new(&mesh.partition, &comm).unwrap();
    let dofs = gs.correspondence();

    let original: Vec<f64> = (0..gs.num_gathered()).map(|g| g as f64 + 1.0).collect();
    let mut local = vec![0.0; gs.num_local()];
    gs.scatter(&mut local, &original, 1);

    // Without pre-division, gathering the scattered field multiplies each dof by its
    // duplicate count.
    let mut gathered = vec![0.0; gs.num_gathered()];
    gs.gather(&mut gathered, &local, 1, GatherOp::Add, &comm)
        .unwrap();
    for g in 0..gs.num_gathered() {
        let count = dofs.duplicates(g).len() as f64;
        assert_eq!(gathered[g], original[g] * count);
    }

    // Pre-dividing every duplicate by its multiplicity makes the round trip exact.
    let mut weighted = local.clone();
    for (slot, value) in weighted.iter_mut().enumerate() {
        let count = dofs.duplicates(dofs.gathered_of(slot)).len() as f64;
        *value /= count;
    }
    gs.gather(&mut gathered, &weighted, 1, GatherOp::Add, &comm)
        .unwrap();
    for g in 0..gs.num_gathered() {
        assert!((gathered[g] - original[g]).abs() < 1e-12);
    }
}

#[test]
fn gather_applies_min_and_max_reductions() {
    let ids = [10, 11, 11, 12];
    let dofs = DofCorrespondence::from_global_ids(&ids).unwrap();
    let comm = LocalComm;
    let gs = {
        let partition = sleipnir::mesh::MeshPartition {
            num_elements: 2,
            nodes_per_element: 2,
            global_node_ids: ids.to_vec(),
            neighbors: Vec::new(),
        };
        GatherScatter::<f64>::new(&partition, &comm).unwrap()
    };
    let local = [5.0, -3.0, 7.0, 2.0];
    let mut gathered = vec![0.0; dofs.num_gathered()];

    gs.gather(&mut gathered, &local, 1, GatherOp::Min, &comm)
        .unwrap();
    assert_eq!(gathered, vec![5.0, -3.0, 2.0]);

    gs.gather(&mut gathered, &local, 1, GatherOp::Max, &comm)
        .unwrap();
    assert_eq!(gathered, vec![5.0, 7.0, 2.0]);
}

#[test]
fn gather_and_scatter_stride_over_multiple_fields() {
    let mesh = unit_square_quad_mesh::<f64>(2, 1, 1, false);
    let comm = LocalComm;
    let gs = GatherScatter::new(&mesh.partition, &comm).unwrap();
    let nl = gs.num_local();
    let ng = gs.num_gathered();

    // Field 0 is all ones, field 1 is all twos.
    let mut local = vec![1.0; 2 * nl];
    for value in &mut local[nl..] {
        *value = 2.0;
    }
    let mut gathered = vec![0.0; 2 * ng];
    gs.gather(&mut gathered, &local, 2, GatherOp::Add, &comm)
        .unwrap();

    let dofs = gs.correspondence();
    for g in 0..ng {
        let count = dofs.duplicates(g).len() as f64;
        assert_eq!(gathered[g], count);
        assert_eq!(gathered[ng + g], 2.0 * count);
    }

    let mut roundtrip = vec![0.0; 2 * nl];
    gs.scatter(&mut roundtrip, &gathered, 2);
    for slot in 0..nl {
        assert_eq!(roundtrip[nl + slot], 2.0 * roundtrip[slot]);
    }
}
