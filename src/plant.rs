//! Multibody plant: a kinematic tree of rigid bodies connected by joints, with fixed frames,
//! model instances, mass properties and (optionally) collision geometries.
//!
//! The plant is immutable once built. Kinematics are generic over [`IkScalar`] so the same sweep
//! gives plain values or forward mode derivatives.

use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::{DVector, Isometry3, Unit, UnitQuaternion, Vector3};
use rand::Rng;

#[cfg(feature = "collisions")]
use parry3d::shape::SharedShape;

use crate::autodiff::IkScalar;
use crate::error::{check_dimension, IkError, IkResult};
use crate::kinematic_traits::{GenericPose, Pose};
use crate::utils::{rotation_about_axis, rotation_from_quaternion};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyIndex(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameIndex(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JointIndex(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelInstanceIndex(pub usize);

#[cfg(feature = "collisions")]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(pub usize);

/// Identity of a built plant, used to check that a context belongs to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PlantId(u64);

static NEXT_PLANT_ID: AtomicU64 = AtomicU64::new(1);

pub const WORLD_BODY: BodyIndex = BodyIndex(0);
pub const WORLD_FRAME: FrameIndex = FrameIndex(0);
pub const WORLD_MODEL_INSTANCE: ModelInstanceIndex = ModelInstanceIndex(0);
pub const DEFAULT_MODEL_INSTANCE: ModelInstanceIndex = ModelInstanceIndex(1);

/// Range used for random sampling of joints without finite limits.
const UNBOUNDED_SAMPLE_RANGE: f64 = PI;

#[derive(Clone, Debug, PartialEq)]
pub enum JointType {
    /// Rotation about an axis expressed in the joint frame.
    Revolute { axis: Unit<Vector3<f64>> },
    /// Translation along an axis expressed in the joint frame.
    Prismatic { axis: Unit<Vector3<f64>> },
    Fixed,
    /// Free motion, positions `[qw, qx, qy, qz, x, y, z]`.
    QuaternionFloating,
}

impl JointType {
    pub fn num_positions(&self) -> usize {
        match self {
            JointType::Revolute { .. } | JointType::Prismatic { .. } => 1,
            JointType::Fixed => 0,
            JointType::QuaternionFloating => 7,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JointType::Revolute { .. } => "revolute",
            JointType::Prismatic { .. } => "prismatic",
            JointType::Fixed => "fixed",
            JointType::QuaternionFloating => "quaternion_floating",
        }
    }

    /// Motion of the child body frame relative to the joint frame.
    fn calc_motion<T: IkScalar>(&self, q: &[T]) -> GenericPose<T> {
        match self {
            JointType::Revolute { axis } => {
                GenericPose::new(rotation_about_axis(axis, &q[0]), Vector3::zeros())
            }
            JointType::Prismatic { axis } => GenericPose::new(
                nalgebra::Matrix3::identity(),
                axis.into_inner().map(|a| T::from_f64(a) * q[0].clone()),
            ),
            JointType::Fixed => GenericPose::identity(),
            JointType::QuaternionFloating => GenericPose::new(
                rotation_from_quaternion(&q[0], &q[1], &q[2], &q[3]),
                Vector3::new(q[4].clone(), q[5].clone(), q[6].clone()),
            ),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Body {
    pub name: String,
    pub model_instance: ModelInstanceIndex,
    pub mass: f64,
    /// Center of mass in the body frame.
    pub p_BoBcm_B: Vector3<f64>,
    pub body_frame: FrameIndex,
    pub inboard_joint: Option<JointIndex>,
}

#[derive(Clone, Debug)]
pub struct Joint {
    pub name: String,
    pub joint_type: JointType,
    pub parent: BodyIndex,
    pub child: BodyIndex,
    /// Joint frame J on the parent body.
    pub X_PJ: Isometry3<f64>,
    pub position_start: usize,
    pub lower_limits: Vec<f64>,
    pub upper_limits: Vec<f64>,
    pub default_positions: Vec<f64>,
}

impl Joint {
    pub fn num_positions(&self) -> usize {
        self.joint_type.num_positions()
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub name: String,
    pub body: BodyIndex,
    /// Pose of this frame in its body frame.
    pub X_BF: Isometry3<f64>,
}

#[cfg(feature = "collisions")]
#[derive(Clone)]
pub struct CollisionGeometry {
    pub name: String,
    pub body: BodyIndex,
    pub X_BG: Isometry3<f64>,
    pub shape: SharedShape,
}

#[cfg(feature = "collisions")]
impl fmt::Debug for CollisionGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollisionGeometry")
            .field("name", &self.name)
            .field("body", &self.body)
            .field("X_BG", &self.X_BG)
            .finish()
    }
}

/// Incrementally describes a plant. Indices returned by the `add_` methods stay valid in the built
/// plant; consistency is checked once in [`MultibodyPlantBuilder::build`].
pub struct MultibodyPlantBuilder {
    model_instances: Vec<String>,
    bodies: Vec<Body>,
    joints: Vec<Joint>,
    frames: Vec<Frame>,
    #[cfg(feature = "collisions")]
    geometries: Vec<CollisionGeometry>,
}

impl Default for MultibodyPlantBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MultibodyPlantBuilder {
    pub fn new() -> Self {
        MultibodyPlantBuilder {
            model_instances: vec!["WorldModelInstance".to_string(), "DefaultModelInstance".to_string()],
            bodies: vec![Body {
                name: "world".to_string(),
                model_instance: WORLD_MODEL_INSTANCE,
                mass: 0.0,
                p_BoBcm_B: Vector3::zeros(),
                body_frame: WORLD_FRAME,
                inboard_joint: None,
            }],
            joints: Vec::new(),
            frames: vec![Frame { name: "world".to_string(), body: WORLD_BODY, X_BF: Isometry3::identity() }],
            #[cfg(feature = "collisions")]
            geometries: Vec::new(),
        }
    }

    pub fn add_model_instance(&mut self, name: &str) -> ModelInstanceIndex {
        self.model_instances.push(name.to_string());
        ModelInstanceIndex(self.model_instances.len() - 1)
    }

    /// Adds a rigid body together with its body frame (named as the body).
    pub fn add_rigid_body(
        &mut self,
        name: &str,
        model_instance: ModelInstanceIndex,
        mass: f64,
        p_BoBcm_B: Vector3<f64>,
    ) -> BodyIndex {
        let index = BodyIndex(self.bodies.len());
        self.frames.push(Frame { name: name.to_string(), body: index, X_BF: Isometry3::identity() });
        self.bodies.push(Body {
            name: name.to_string(),
            model_instance,
            mass,
            p_BoBcm_B,
            body_frame: FrameIndex(self.frames.len() - 1),
            inboard_joint: None,
        });
        index
    }

    /// Adds a joint connecting `parent` to `child`. `limits` applies to single position joints,
    /// unlimited when `None`.
    pub fn add_joint(
        &mut self,
        name: &str,
        joint_type: JointType,
        parent: BodyIndex,
        X_PJ: Isometry3<f64>,
        child: BodyIndex,
        limits: Option<(f64, f64)>,
    ) -> JointIndex {
        let (lower_limits, upper_limits, default_positions) = match &joint_type {
            JointType::Revolute { .. } | JointType::Prismatic { .. } => {
                let (lower, upper) = limits.unwrap_or((f64::NEG_INFINITY, f64::INFINITY));
                let default = if lower > 0.0 { lower } else if upper < 0.0 { upper } else { 0.0 };
                (vec![lower], vec![upper], vec![default])
            }
            JointType::Fixed => (vec![], vec![], vec![]),
            JointType::QuaternionFloating => {
                let mut lower = vec![-1.0; 4];
                let mut upper = vec![1.0; 4];
                lower.extend([f64::NEG_INFINITY; 3]);
                upper.extend([f64::INFINITY; 3]);
                (lower, upper, vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
            }
        };
        self.joints.push(Joint {
            name: name.to_string(),
            joint_type,
            parent,
            child,
            X_PJ,
            position_start: 0,
            lower_limits,
            upper_limits,
            default_positions,
        });
        JointIndex(self.joints.len() - 1)
    }

    pub fn add_frame(&mut self, name: &str, body: BodyIndex, X_BF: Isometry3<f64>) -> FrameIndex {
        self.frames.push(Frame { name: name.to_string(), body, X_BF });
        FrameIndex(self.frames.len() - 1)
    }

    #[cfg(feature = "collisions")]
    pub fn add_collision_geometry(
        &mut self,
        name: &str,
        body: BodyIndex,
        X_BG: Isometry3<f64>,
        shape: SharedShape,
    ) -> GeometryId {
        self.geometries.push(CollisionGeometry { name: name.to_string(), body, X_BG, shape });
        GeometryId(self.geometries.len() - 1)
    }

    /// Validates the tree and assigns position coordinates in breadth first order from the world.
    pub fn build(mut self) -> IkResult<MultibodyPlant> {
        unique_names("body", self.bodies.iter().map(|b| b.name.as_str()))?;
        unique_names("joint", self.joints.iter().map(|j| j.name.as_str()))?;
        unique_names("frame", self.frames.iter().map(|f| f.name.as_str()))?;

        for body in &self.bodies {
            if body.model_instance.0 >= self.model_instances.len() {
                return Err(IkError::UnknownModelInstance(format!("{:?} of body {}", body.model_instance, body.name)));
            }
            if !(body.mass >= 0.0) || !body.mass.is_finite() {
                return Err(IkError::InvalidArgument(format!("Mass of {} must be finite and non-negative", body.name)));
            }
        }
        for frame in &self.frames {
            if frame.body.0 >= self.bodies.len() {
                return Err(IkError::UnknownBody(format!("{:?} of frame {}", frame.body, frame.name)));
            }
        }
        #[cfg(feature = "collisions")]
        for geometry in &self.geometries {
            if geometry.body.0 >= self.bodies.len() {
                return Err(IkError::UnknownBody(format!("{:?} of geometry {}", geometry.body, geometry.name)));
            }
        }

        let mut children: Vec<Vec<JointIndex>> = vec![Vec::new(); self.bodies.len()];
        for (index, joint) in self.joints.iter().enumerate() {
            if joint.parent.0 >= self.bodies.len() || joint.child.0 >= self.bodies.len() {
                return Err(IkError::UnknownBody(format!("Joint {} connects unknown bodies", joint.name)));
            }
            if joint.child == WORLD_BODY {
                return Err(IkError::InvalidTree(format!("Joint {} has the world as child", joint.name)));
            }
            if joint.parent == joint.child {
                return Err(IkError::InvalidTree(format!("Joint {} connects a body to itself", joint.name)));
            }
            if let Some(existing) = self.bodies[joint.child.0].inboard_joint {
                return Err(IkError::InvalidTree(format!(
                    "Body {} has two parent joints: {} and {}",
                    self.bodies[joint.child.0].name, self.joints[existing.0].name, joint.name
                )));
            }
            self.bodies[joint.child.0].inboard_joint = Some(JointIndex(index));
            children[joint.parent.0].push(JointIndex(index));

            match &joint.joint_type {
                JointType::Revolute { axis } | JointType::Prismatic { axis } => {
                    if !axis.iter().all(|a| a.is_finite()) {
                        return Err(IkError::InvalidArgument(format!("Axis of joint {} is not finite", joint.name)));
                    }
                }
                _ => {}
            }
            for (i, (lower, upper)) in joint.lower_limits.iter().zip(&joint.upper_limits).enumerate() {
                if !(lower <= upper) {
                    return Err(IkError::InvalidBounds {
                        what: format!("limits of joint {}", joint.name),
                        index: i,
                        lower: *lower,
                        upper: *upper,
                    });
                }
            }
        }

        // Breadth first sweep from the world. Every body must be reached exactly once.
        let mut joint_order = Vec::with_capacity(self.joints.len());
        let mut queue = VecDeque::from([WORLD_BODY]);
        let mut reached = vec![false; self.bodies.len()];
        reached[WORLD_BODY.0] = true;
        let mut num_positions = 0;
        while let Some(body) = queue.pop_front() {
            for &joint_index in &children[body.0] {
                let joint = &mut self.joints[joint_index.0];
                joint.position_start = num_positions;
                num_positions += joint.num_positions();
                joint_order.push(joint_index);
                reached[joint.child.0] = true;
                queue.push_back(joint.child);
            }
        }
        if let Some(unreached) = reached.iter().position(|r| !r) {
            return Err(IkError::InvalidTree(format!(
                "Body {} is not connected to the world",
                self.bodies[unreached].name
            )));
        }

        let name_index = |names: Vec<&str>| -> HashMap<String, usize> {
            names.into_iter().enumerate().map(|(i, n)| (n.to_string(), i)).collect()
        };

        Ok(MultibodyPlant {
            id: PlantId(NEXT_PLANT_ID.fetch_add(1, Ordering::Relaxed)),
            body_names: name_index(self.bodies.iter().map(|b| b.name.as_str()).collect()),
            frame_names: name_index(self.frames.iter().map(|f| f.name.as_str()).collect()),
            joint_names: name_index(self.joints.iter().map(|j| j.name.as_str()).collect()),
            model_instances: self.model_instances,
            bodies: self.bodies,
            joints: self.joints,
            frames: self.frames,
            #[cfg(feature = "collisions")]
            geometries: self.geometries,
            joint_order,
            num_positions,
        })
    }
}

fn unique_names<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> IkResult<()> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(IkError::InvalidTree(format!("Duplicate {} name: {}", what, name)));
        }
    }
    Ok(())
}

pub struct MultibodyPlant {
    id: PlantId,
    model_instances: Vec<String>,
    bodies: Vec<Body>,
    joints: Vec<Joint>,
    frames: Vec<Frame>,
    #[cfg(feature = "collisions")]
    geometries: Vec<CollisionGeometry>,
    body_names: HashMap<String, usize>,
    frame_names: HashMap<String, usize>,
    joint_names: HashMap<String, usize>,
    /// Joints in the order of the kinematic sweep, parents before children.
    joint_order: Vec<JointIndex>,
    num_positions: usize,
}

impl fmt::Debug for MultibodyPlant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultibodyPlant")
            .field("id", &self.id)
            .field("num_bodies", &self.bodies.len())
            .field("num_joints", &self.joints.len())
            .field("num_positions", &self.num_positions)
            .finish()
    }
}

impl MultibodyPlant {
    pub fn id(&self) -> PlantId {
        self.id
    }

    pub fn num_positions(&self) -> usize {
        self.num_positions
    }

    /// Number of bodies including the world.
    pub fn num_bodies(&self) -> usize {
        self.bodies.len()
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn num_joints(&self) -> usize {
        self.joints.len()
    }

    pub fn num_model_instances(&self) -> usize {
        self.model_instances.len()
    }

    pub fn world_frame(&self) -> FrameIndex {
        WORLD_FRAME
    }

    pub fn world_body(&self) -> BodyIndex {
        WORLD_BODY
    }

    pub fn body(&self, index: BodyIndex) -> IkResult<&Body> {
        self.bodies.get(index.0).ok_or_else(|| IkError::UnknownBody(format!("{:?}", index)))
    }

    pub fn joint(&self, index: JointIndex) -> IkResult<&Joint> {
        self.joints.get(index.0).ok_or_else(|| IkError::UnknownJoint(format!("{:?}", index)))
    }

    pub fn frame(&self, index: FrameIndex) -> IkResult<&Frame> {
        self.frames.get(index.0).ok_or_else(|| IkError::UnknownFrame(format!("{:?}", index)))
    }

    pub fn bodies(&self) -> &[Body] {
        &self.bodies
    }

    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }

    /// Joints ordered parents first.
    pub fn joints_in_tree_order(&self) -> impl Iterator<Item = &Joint> {
        self.joint_order.iter().map(|j| &self.joints[j.0])
    }

    pub fn body_frame(&self, body: BodyIndex) -> IkResult<FrameIndex> {
        Ok(self.body(body)?.body_frame)
    }

    pub fn get_body_by_name(&self, name: &str) -> IkResult<BodyIndex> {
        self.body_names.get(name).map(|i| BodyIndex(*i)).ok_or_else(|| IkError::UnknownBody(name.to_string()))
    }

    pub fn get_frame_by_name(&self, name: &str) -> IkResult<FrameIndex> {
        self.frame_names.get(name).map(|i| FrameIndex(*i)).ok_or_else(|| IkError::UnknownFrame(name.to_string()))
    }

    pub fn get_joint_by_name(&self, name: &str) -> IkResult<JointIndex> {
        self.joint_names.get(name).map(|i| JointIndex(*i)).ok_or_else(|| IkError::UnknownJoint(name.to_string()))
    }

    pub fn get_model_instance_by_name(&self, name: &str) -> IkResult<ModelInstanceIndex> {
        self.model_instances
            .iter()
            .position(|n| n == name)
            .map(ModelInstanceIndex)
            .ok_or_else(|| IkError::UnknownModelInstance(name.to_string()))
    }

    pub fn model_instance_name(&self, index: ModelInstanceIndex) -> IkResult<&str> {
        self.model_instances
            .get(index.0)
            .map(|s| s.as_str())
            .ok_or_else(|| IkError::UnknownModelInstance(format!("{:?}", index)))
    }

    pub fn bodies_in_model_instance(&self, instance: ModelInstanceIndex) -> Vec<BodyIndex> {
        self.bodies
            .iter()
            .enumerate()
            .filter(|(_, b)| b.model_instance == instance)
            .map(|(i, _)| BodyIndex(i))
            .collect()
    }

    /// The joint that moves `body` relative to its parent, `None` for the world.
    pub fn inboard_joint(&self, body: BodyIndex) -> IkResult<Option<&Joint>> {
        Ok(self.body(body)?.inboard_joint.map(|j| &self.joints[j.0]))
    }

    pub fn quaternion_floating_joints(&self) -> impl Iterator<Item = &Joint> {
        self.joints.iter().filter(|j| j.joint_type == JointType::QuaternionFloating)
    }

    pub fn position_lower_limits(&self) -> DVector<f64> {
        self.collect_positions(|j| &j.lower_limits)
    }

    pub fn position_upper_limits(&self) -> DVector<f64> {
        self.collect_positions(|j| &j.upper_limits)
    }

    pub fn default_positions(&self) -> DVector<f64> {
        self.collect_positions(|j| &j.default_positions)
    }

    fn collect_positions(&self, values: impl Fn(&Joint) -> &Vec<f64>) -> DVector<f64> {
        let mut q = DVector::zeros(self.num_positions);
        for joint in &self.joints {
            for (i, v) in values(joint).iter().enumerate() {
                q[joint.position_start + i] = *v;
            }
        }
        q
    }

    /// Uniformly random positions within joint limits. Unlimited joints are sampled in
    /// `[-pi, pi]`, floating joints get a random unit quaternion and a translation in the unit cube.
    pub fn random_positions<R: Rng>(&self, rng: &mut R) -> DVector<f64> {
        let mut q = DVector::zeros(self.num_positions);
        for joint in &self.joints {
            let s = joint.position_start;
            match joint.joint_type {
                JointType::Revolute { .. } | JointType::Prismatic { .. } => {
                    let lower = joint.lower_limits[0].max(-UNBOUNDED_SAMPLE_RANGE);
                    let upper = joint.upper_limits[0].min(UNBOUNDED_SAMPLE_RANGE);
                    q[s] = if lower < upper { rng.gen_range(lower..=upper) } else { lower };
                }
                JointType::QuaternionFloating => {
                    let rotation = UnitQuaternion::from_euler_angles(
                        rng.gen_range(-PI..PI),
                        rng.gen_range(-PI / 2.0..PI / 2.0),
                        rng.gen_range(-PI..PI),
                    );
                    q[s] = rotation.w;
                    q[s + 1] = rotation.i;
                    q[s + 2] = rotation.j;
                    q[s + 3] = rotation.k;
                    for i in 4..7 {
                        q[s + i] = rng.gen_range(-1.0..1.0);
                    }
                }
                JointType::Fixed => {}
            }
        }
        q
    }

    pub fn total_mass(&self, instances: &[ModelInstanceIndex]) -> f64 {
        self.bodies
            .iter()
            .filter(|b| instances.contains(&b.model_instance))
            .map(|b| b.mass)
            .sum()
    }

    /// Model instances other than the world one.
    pub fn non_world_model_instances(&self) -> Vec<ModelInstanceIndex> {
        (1..self.model_instances.len()).map(ModelInstanceIndex).collect()
    }

    /// World poses of all bodies, indexed by [`BodyIndex`].
    pub fn calc_body_poses<T: IkScalar>(&self, q: &[T]) -> IkResult<Vec<GenericPose<T>>> {
        check_dimension("generalized positions", self.num_positions, q.len())?;
        let mut poses = vec![GenericPose::identity(); self.bodies.len()];
        for &joint_index in &self.joint_order {
            let joint = &self.joints[joint_index.0];
            let range = joint.position_start..joint.position_start + joint.num_positions();
            let X_WJ = poses[joint.parent.0].compose(&GenericPose::from_isometry(&joint.X_PJ));
            poses[joint.child.0] = X_WJ.compose(&joint.joint_type.calc_motion(&q[range]));
        }
        Ok(poses)
    }

    /// Pose of `frame` in world given the body poses from [`Self::calc_body_poses`].
    pub fn frame_pose_from_body_poses<T: IkScalar>(
        &self,
        body_poses: &[GenericPose<T>],
        frame: FrameIndex,
    ) -> IkResult<GenericPose<T>> {
        let frame = self.frame(frame)?;
        Ok(body_poses[frame.body.0].compose(&GenericPose::from_isometry(&frame.X_BF)))
    }

    pub fn calc_frame_pose_in_world<T: IkScalar>(&self, q: &[T], frame: FrameIndex) -> IkResult<GenericPose<T>> {
        let poses = self.calc_body_poses(q)?;
        self.frame_pose_from_body_poses(&poses, frame)
    }

    /// Pose of `frame_b` measured in `frame_a`.
    pub fn calc_relative_transform<T: IkScalar>(
        &self,
        q: &[T],
        frame_a: FrameIndex,
        frame_b: FrameIndex,
    ) -> IkResult<GenericPose<T>> {
        let poses = self.calc_body_poses(q)?;
        let X_WA = self.frame_pose_from_body_poses(&poses, frame_a)?;
        let X_WB = self.frame_pose_from_body_poses(&poses, frame_b)?;
        Ok(X_WA.inverse_compose(&X_WB))
    }

    /// Center of mass of the bodies in `instances`, expressed in world.
    pub fn center_of_mass_from_body_poses<T: IkScalar>(
        &self,
        body_poses: &[GenericPose<T>],
        instances: &[ModelInstanceIndex],
    ) -> IkResult<nalgebra::Vector3<T>> {
        let total_mass = self.total_mass(instances);
        if total_mass <= 0.0 {
            return Err(IkError::InvalidArgument(format!(
                "Model instances {:?} have zero total mass",
                instances
            )));
        }
        let mut weighted = Vector3::zeros();
        for (index, body) in self.bodies.iter().enumerate() {
            if body.mass > 0.0 && instances.contains(&body.model_instance) {
                let p_WBcm = body_poses[index].transform_point_f64(&body.p_BoBcm_B);
                weighted += p_WBcm.map(|x| x.scale(body.mass));
            }
        }
        Ok(weighted.map(|x| x.scale(1.0 / total_mass)))
    }

    /// Validates a model instance list; `None` selects all non-world instances.
    pub fn resolve_model_instances(
        &self,
        instances: Option<&[ModelInstanceIndex]>,
    ) -> IkResult<Vec<ModelInstanceIndex>> {
        match instances {
            None => Ok(self.non_world_model_instances()),
            Some([]) => Err(IkError::MalformedModelInstances("the list is empty".to_string())),
            Some(list) => {
                for (i, instance) in list.iter().enumerate() {
                    if instance.0 >= self.model_instances.len() {
                        return Err(IkError::MalformedModelInstances(format!("{:?} does not exist", instance)));
                    }
                    if list[..i].contains(instance) {
                        return Err(IkError::MalformedModelInstances(format!("{:?} is listed twice", instance)));
                    }
                }
                Ok(list.to_vec())
            }
        }
    }

    #[cfg(feature = "collisions")]
    pub fn geometries(&self) -> &[CollisionGeometry] {
        &self.geometries
    }

    #[cfg(feature = "collisions")]
    pub fn geometry(&self, id: GeometryId) -> IkResult<&CollisionGeometry> {
        self.geometries.get(id.0).ok_or_else(|| IkError::UnknownGeometry(format!("{:?}", id)))
    }

    #[cfg(feature = "collisions")]
    pub fn get_geometry_by_name(&self, name: &str) -> IkResult<GeometryId> {
        self.geometries
            .iter()
            .position(|g| g.name == name)
            .map(GeometryId)
            .ok_or_else(|| IkError::UnknownGeometry(name.to_string()))
    }

    /// Bodies directly connected by a joint. Collision between them is not checked.
    pub fn are_adjacent(&self, a: BodyIndex, b: BodyIndex) -> bool {
        self.joints.iter().any(|j| (j.parent == a && j.child == b) || (j.parent == b && j.child == a))
    }

    /// Plain pose of a frame in its body, for callers that only need constants.
    pub fn frame_offset(&self, frame: FrameIndex) -> IkResult<(BodyIndex, Pose)> {
        let frame = self.frame(frame)?;
        Ok((frame.body, frame.X_BF))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Translation3;

    fn pendulum() -> MultibodyPlant {
        let mut builder = MultibodyPlantBuilder::new();
        let link = builder.add_rigid_body("link", DEFAULT_MODEL_INSTANCE, 2.0, Vector3::new(0.5, 0.0, 0.0));
        builder.add_joint(
            "pin",
            JointType::Revolute { axis: Vector3::z_axis() },
            WORLD_BODY,
            Isometry3::translation(0.0, 0.0, 1.0),
            link,
            Some((-2.0, 2.0)),
        );
        builder.add_frame("tip", link, Isometry3::translation(1.0, 0.0, 0.0));
        builder.build().expect("valid pendulum")
    }

    #[test]
    fn test_pendulum_kinematics() {
        let plant = pendulum();
        assert_eq!(plant.num_positions(), 1);
        let tip = plant.get_frame_by_name("tip").unwrap();
        let pose = plant.calc_frame_pose_in_world(&[PI / 2.0], tip).unwrap();
        let p = pose.translation_value();
        assert!((p - Vector3::new(0.0, 1.0, 1.0)).norm() < 1e-12);

        let poses = plant.calc_body_poses(&[0.0]).unwrap();
        let com = plant.center_of_mass_from_body_poses(&poses, &[DEFAULT_MODEL_INSTANCE]).unwrap();
        assert!((com - Vector3::new(0.5, 0.0, 1.0)).norm() < 1e-12);
    }

    #[test]
    fn test_limits_and_defaults() {
        let plant = pendulum();
        assert_eq!(plant.position_lower_limits()[0], -2.0);
        assert_eq!(plant.position_upper_limits()[0], 2.0);
        assert_eq!(plant.default_positions()[0], 0.0);
    }

    #[test]
    fn test_floating_body_positions() {
        let mut builder = MultibodyPlantBuilder::new();
        let body = builder.add_rigid_body("box", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        builder.add_joint("free", JointType::QuaternionFloating, WORLD_BODY, Isometry3::identity(), body, None);
        let plant = builder.build().unwrap();
        assert_eq!(plant.num_positions(), 7);
        assert_eq!(plant.quaternion_floating_joints().count(), 1);
        let q0 = plant.default_positions();
        assert_eq!(q0[0], 1.0);

        let rotation = UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3);
        let q = [rotation.w, rotation.i, rotation.j, rotation.k, 1.0, 2.0, 3.0];
        let pose = plant.calc_body_poses(&q).unwrap()[body.0].to_isometry();
        let expected = Isometry3::from_parts(Translation3::new(1.0, 2.0, 3.0), rotation);
        assert!((pose.translation.vector - expected.translation.vector).norm() < 1e-12);
        assert!(pose.rotation.angle_to(&expected.rotation) < 1e-9);
    }

    #[test]
    fn test_invalid_trees_rejected() {
        let mut builder = MultibodyPlantBuilder::new();
        let a = builder.add_rigid_body("a", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        builder.add_joint("j1", JointType::Fixed, WORLD_BODY, Isometry3::identity(), a, None);
        builder.add_joint("j2", JointType::Fixed, WORLD_BODY, Isometry3::identity(), a, None);
        assert!(matches!(builder.build(), Err(IkError::InvalidTree(_))));

        let mut builder = MultibodyPlantBuilder::new();
        builder.add_rigid_body("orphan", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        assert!(matches!(builder.build(), Err(IkError::InvalidTree(_))));

        let mut builder = MultibodyPlantBuilder::new();
        let a = builder.add_rigid_body("a", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        builder.add_joint("j", JointType::Revolute { axis: Vector3::x_axis() },
                          WORLD_BODY, Isometry3::identity(), a, Some((1.0, -1.0)));
        assert!(matches!(builder.build(), Err(IkError::InvalidBounds { .. })));
    }

    #[test]
    fn test_model_instance_validation() {
        let plant = pendulum();
        assert!(plant.resolve_model_instances(Some(&[])).is_err());
        assert!(plant.resolve_model_instances(Some(&[ModelInstanceIndex(7)])).is_err());
        assert!(plant.resolve_model_instances(Some(&[DEFAULT_MODEL_INSTANCE, DEFAULT_MODEL_INSTANCE])).is_err());
        assert_eq!(plant.resolve_model_instances(None).unwrap(), vec![DEFAULT_MODEL_INSTANCE]);
    }

    #[test]
    fn test_plant_ids_are_unique() {
        assert_ne!(pendulum().id(), pendulum().id());
    }
}
