//! Builds a [`MultibodyPlant`] from URDF (optional)

extern crate sxd_document;

use std::collections::{HashMap, HashSet};
use std::fs::read_to_string;
use std::path::Path;

use nalgebra::{Isometry3, Translation3, Unit, UnitQuaternion, Vector3};
use regex::Regex;
use sxd_document::{dom, parser, QName};
use tracing::debug;

#[cfg(feature = "collisions")]
use parry3d::shape::SharedShape;

use crate::error::{IkError, IkResult};
use crate::plant::{BodyIndex, JointType, ModelInstanceIndex, MultibodyPlant, MultibodyPlantBuilder, WORLD_BODY};

/// How the root link of the URDF is attached to the world.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatingBase {
    /// Welded to the world at the identity.
    Welded,
    /// Free to move, with a quaternion floating joint.
    Quaternion,
}

/// Reads URDF file and builds the plant. See [`plant_from_urdf`].
pub fn plant_from_urdf_file<P: AsRef<Path>>(path: P, floating_base: FloatingBase) -> IkResult<MultibodyPlant> {
    let xml_content = read_to_string(path)?;
    plant_from_urdf(&xml_content, floating_base)
}

/// Parses URDF content into a plant. Links become bodies of one model instance named after the
/// robot, with their `<inertial>` mass and center of mass; `revolute`, `continuous`, `prismatic`,
/// `fixed` and `floating` joints are supported. Limits and `rpy` angles may be given in radians or
/// as `${radians(degrees)}` as common in xacro. With the `collisions` feature, sphere, box and
/// cylinder `<collision>` elements become collision geometries.
///
/// # Example
/// ```
/// use rs_multibody_ik::urdf::{plant_from_urdf, FloatingBase};
/// let urdf = r#"<robot name="pendulum">
///   <link name="base"/>
///   <link name="arm"><inertial><mass value="1.5"/><origin xyz="0 0 -0.5"/></inertial></link>
///   <joint name="hinge" type="revolute">
///     <parent link="base"/><child link="arm"/>
///     <axis xyz="0 1 0"/><limit lower="${radians(-90)}" upper="${radians(90)}"/>
///   </joint>
/// </robot>"#;
/// let plant = plant_from_urdf(urdf, FloatingBase::Welded).unwrap();
/// assert_eq!(plant.num_positions(), 1);
/// ```
pub fn plant_from_urdf(xml_content: &str, floating_base: FloatingBase) -> IkResult<MultibodyPlant> {
    let package = parser::parse(xml_content)
        .map_err(|e| IkError::XmlProcessingError(format!("Failed to parse URDF: {}", e)))?;
    let document = package.as_document();
    let root_element = document.root().children().into_iter()
        .find_map(|e| e.element())
        .ok_or_else(|| IkError::XmlProcessingError("No root element found".to_string()))?;

    let mut builder = MultibodyPlantBuilder::new();
    let robot_name = root_element.attribute("name").map_or("robot", |a| a.value());
    let instance = builder.add_model_instance(robot_name);

    let mut links = Vec::new();
    let mut joints = Vec::new();
    collect_elements(root_element, &mut links, &mut joints);

    let mut bodies: HashMap<String, BodyIndex> = HashMap::new();
    for link in &links {
        let name = required_attribute(*link, "name", "link")?;
        let body = add_link(&mut builder, *link, &name, instance)?;
        if bodies.insert(name.clone(), body).is_some() {
            return Err(IkError::XmlProcessingError(format!("Duplicate link {}", name)));
        }
    }

    let mut children = HashSet::new();
    for joint in &joints {
        let child = add_joint(&mut builder, *joint, &bodies)?;
        children.insert(child);
    }

    let mut roots: Vec<(&String, &BodyIndex)> = bodies.iter().filter(|(_, b)| !children.contains(*b)).collect();
    roots.sort_by_key(|(_, b)| b.0);
    for (name, body) in roots {
        let joint_type = match floating_base {
            FloatingBase::Welded => JointType::Fixed,
            FloatingBase::Quaternion => JointType::QuaternionFloating,
        };
        builder.add_joint(&format!("{}_{}", name, joint_type.name()), joint_type, WORLD_BODY, Isometry3::identity(), *body, None);
    }
    debug!("URDF {}: {} links, {} joints", robot_name, links.len(), joints.len());
    builder.build()
}

// Recursive function to collect links and joints, also from inside of macros
fn collect_elements<'d>(element: dom::Element<'d>, links: &mut Vec<dom::Element<'d>>, joints: &mut Vec<dom::Element<'d>>) {
    let link_tag = QName::new("link");
    let joint_tag = QName::new("joint");
    for child in element.children().into_iter().filter_map(|e| e.element()) {
        if child.name() == link_tag {
            links.push(child);
        } else if child.name() == joint_tag {
            joints.push(child);
        } else {
            collect_elements(child, links, joints);
        }
    }
}

fn child_element<'d>(element: dom::Element<'d>, tag: &str) -> Option<dom::Element<'d>> {
    let tag = QName::new(tag);
    element.children().into_iter().find_map(|e| e.element().filter(|el| el.name() == tag))
}

fn required_attribute(element: dom::Element, attribute: &str, context: &str) -> IkResult<String> {
    element.attribute(attribute)
        .map(|a| a.value().to_string())
        .ok_or_else(|| IkError::MissingField(format!("{} of {}", attribute, context)))
}

fn add_link(builder: &mut MultibodyPlantBuilder, link: dom::Element, name: &str, instance: ModelInstanceIndex) -> IkResult<BodyIndex> {
    let (mass, p_BoBcm_B) = match child_element(link, "inertial") {
        Some(inertial) => {
            let mass = match child_element(inertial, "mass") {
                Some(mass) => parse_number(&required_attribute(mass, "value", name)?)?,
                None => 0.0,
            };
            let origin = child_element(inertial, "origin").map(get_origin).transpose()?;
            (mass, origin.map_or_else(Vector3::zeros, |o| o.translation.vector))
        }
        None => (0.0, Vector3::zeros()),
    };
    let body = builder.add_rigid_body(name, instance, mass, p_BoBcm_B);

    #[cfg(feature = "collisions")]
    {
        let collision_tag = QName::new("collision");
        let collisions = link.children().into_iter()
            .filter_map(|e| e.element().filter(|el| el.name() == collision_tag));
        for (i, collision) in collisions.enumerate() {
            let X_BG = child_element(collision, "origin").map(get_origin).transpose()?.unwrap_or_else(Isometry3::identity);
            let geometry = child_element(collision, "geometry")
                .ok_or_else(|| IkError::MissingField(format!("geometry of collision {} in {}", i, name)))?;
            let geometry_name = collision.attribute("name")
                .map_or_else(|| format!("{}_collision_{}", name, i), |a| a.value().to_string());
            match collision_shape(geometry, name)? {
                Some((shape, X_GS)) => {
                    builder.add_collision_geometry(&geometry_name, body, X_BG * X_GS, shape);
                }
                None => debug!("Skipping collision {} of {}: only sphere, box and cylinder are supported", i, name),
            }
        }
    }
    Ok(body)
}

/// Shape and its pose in the URDF geometry frame. URDF cylinders are along Z, parry ones along Y.
#[cfg(feature = "collisions")]
fn collision_shape(geometry: dom::Element, link: &str) -> IkResult<Option<(SharedShape, Isometry3<f64>)>> {
    if let Some(sphere) = child_element(geometry, "sphere") {
        let radius = parse_number(&required_attribute(sphere, "radius", link)?)?;
        return Ok(Some((SharedShape::ball(radius as f32), Isometry3::identity())));
    }
    if let Some(cuboid) = child_element(geometry, "box") {
        let size = parse_triplet(&required_attribute(cuboid, "size", link)?, parse_number)?;
        return Ok(Some((
            SharedShape::cuboid(size.x as f32 / 2.0, size.y as f32 / 2.0, size.z as f32 / 2.0),
            Isometry3::identity(),
        )));
    }
    if let Some(cylinder) = child_element(geometry, "cylinder") {
        let radius = parse_number(&required_attribute(cylinder, "radius", link)?)?;
        let length = parse_number(&required_attribute(cylinder, "length", link)?)?;
        let y_to_z = Isometry3::rotation(Vector3::x() * std::f64::consts::FRAC_PI_2);
        return Ok(Some((SharedShape::cylinder(length as f32 / 2.0, radius as f32), y_to_z)));
    }
    Ok(None)
}

fn add_joint(builder: &mut MultibodyPlantBuilder, joint: dom::Element, bodies: &HashMap<String, BodyIndex>) -> IkResult<BodyIndex> {
    let name = required_attribute(joint, "name", "joint")?;
    let kind = required_attribute(joint, "type", &name)?;
    let link_of = |tag: &str| -> IkResult<BodyIndex> {
        let element = child_element(joint, tag)
            .ok_or_else(|| IkError::MissingField(format!("{} of joint {}", tag, name)))?;
        let link = required_attribute(element, "link", &name)?;
        bodies.get(&link).copied()
            .ok_or_else(|| IkError::XmlProcessingError(format!("Joint {} refers to unknown link {}", name, link)))
    };
    let parent = link_of("parent")?;
    let child = link_of("child")?;
    let X_PJ = child_element(joint, "origin").map(get_origin).transpose()?.unwrap_or_else(Isometry3::identity);
    let axis = match child_element(joint, "axis") {
        Some(axis) => {
            let xyz = parse_triplet(&required_attribute(axis, "xyz", &name)?, parse_number)?;
            Unit::try_new(xyz, f64::EPSILON)
                .ok_or_else(|| IkError::XmlProcessingError(format!("Zero axis of joint {}", name)))?
        }
        None => Vector3::x_axis(),
    };
    let limits = child_element(joint, "limit").map(get_limits).transpose()?;

    let (joint_type, limits) = match kind.as_str() {
        "revolute" => (JointType::Revolute { axis }, Some(limits.ok_or_else(|| IkError::MissingField(format!("limit of revolute joint {}", name)))?)),
        "continuous" => (JointType::Revolute { axis }, None),
        "prismatic" => (JointType::Prismatic { axis }, limits),
        "fixed" => (JointType::Fixed, None),
        "floating" => (JointType::QuaternionFloating, None),
        other => return Err(IkError::UnsupportedJoint { joint: name, kind: other.to_string() }),
    };
    builder.add_joint(&name, joint_type, parent, X_PJ, child, limits);
    Ok(child)
}

fn get_origin(element: dom::Element) -> IkResult<Isometry3<f64>> {
    let xyz = match element.attribute("xyz") {
        Some(xyz) => parse_triplet(xyz.value(), parse_number)?,
        None => Vector3::zeros(),
    };
    let rpy = match element.attribute("rpy") {
        Some(rpy) => parse_triplet(rpy.value(), parse_angle)?,
        None => Vector3::zeros(),
    };
    Ok(Isometry3::from_parts(Translation3::from(xyz), UnitQuaternion::from_euler_angles(rpy.x, rpy.y, rpy.z)))
}

fn parse_number(value: &str) -> IkResult<f64> {
    value.trim().parse().map_err(|_| IkError::ParseError(format!("Not a number: {}", value)))
}

fn parse_triplet(value: &str, parse: fn(&str) -> IkResult<f64>) -> IkResult<Vector3<f64>> {
    let values: Vec<f64> = value.split_whitespace().map(parse).collect::<Result<_, _>>()?;
    if values.len() != 3 {
        return Err(IkError::ParseError(format!("Expected three values, got '{}'", value)));
    }
    Ok(Vector3::new(values[0], values[1], values[2]))
}

fn parse_angle(attr_value: &str) -> IkResult<f64> {
    // Regular expression to match the ${radians(<number>)} format that is common in xacro
    let re = Regex::new(r"^\$\{radians\((-?\d+(\.\d+)?)\)\}$")
        .map_err(|_| IkError::ParseError("Invalid regex pattern".to_string()))?;

    if let Some(caps) = re.captures(attr_value) {
        let degrees_str = caps.get(1)
            .ok_or_else(|| IkError::WrongAngle(format!("Bad representation: {}", attr_value)))?.as_str();
        let degrees: f64 = degrees_str.parse()
            .map_err(|_| IkError::WrongAngle(attr_value.to_string()))?;
        Ok(degrees.to_radians())
    } else {
        // Plain number is in radians
        attr_value.trim().parse()
            .map_err(|_| IkError::WrongAngle(attr_value.to_string()))
    }
}

fn get_limits(element: dom::Element) -> IkResult<(f64, f64)> {
    let lower_attr = element.attribute("lower")
        .ok_or_else(|| IkError::MissingField("lower limit not found".into()))?
        .value();
    let lower_limit = parse_angle(lower_attr)?;

    let upper_attr = element.attribute("upper")
        .ok_or_else(|| IkError::MissingField("upper limit not found".into()))?
        .value();
    let upper_limit = parse_angle(upper_attr)?;

    Ok((lower_limit, upper_limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARM: &str = r#"<?xml version="1.0"?>
<robot name="arm">
  <link name="base"/>
  <link name="upper">
    <inertial><origin xyz="0.25 0 0"/><mass value="2.0"/></inertial>
    <collision><origin xyz="0.25 0 0" rpy="0 ${radians(90)} 0"/><geometry><cylinder radius="0.05" length="0.5"/></geometry></collision>
  </link>
  <link name="tool"/>
  <joint name="shoulder" type="revolute">
    <parent link="base"/>
    <child link="upper"/>
    <origin xyz="0 0 0.1" rpy="0 0 0"/>
    <axis xyz="0 0 1"/>
    <limit lower="${radians(-120)}" upper="2.0" effort="1" velocity="1"/>
  </joint>
  <joint name="flange" type="fixed">
    <parent link="upper"/>
    <child link="tool"/>
    <origin xyz="0.5 0 0"/>
  </joint>
</robot>"#;

    #[test]
    fn test_parse_angle() {
        assert!((parse_angle("${radians(90)}").unwrap() - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        assert!((parse_angle("${radians(-45.5)}").unwrap() + 45.5f64.to_radians()).abs() < 1e-12);
        assert_eq!(parse_angle("1.25").unwrap(), 1.25);
        assert!(matches!(parse_angle("${pi}"), Err(IkError::WrongAngle(_))));
    }

    #[test]
    fn test_welded_arm() {
        let plant = plant_from_urdf(ARM, FloatingBase::Welded).unwrap();
        assert_eq!(plant.num_positions(), 1);
        let shoulder = plant.joint(plant.get_joint_by_name("shoulder").unwrap()).unwrap();
        assert!((shoulder.lower_limits[0] + 120f64.to_radians()).abs() < 1e-12);
        assert_eq!(shoulder.upper_limits[0], 2.0);
        let upper = plant.get_body_by_name("upper").unwrap();
        assert_eq!(plant.body(upper).unwrap().mass, 2.0);

        let q = [std::f64::consts::FRAC_PI_2];
        let tool = plant.get_frame_by_name("tool").unwrap();
        let X_WT = plant.calc_frame_pose_in_world(&q, tool).unwrap().to_isometry();
        assert!((X_WT.translation.vector - Vector3::new(0.0, 0.5, 0.1)).norm() < 1e-12);
        #[cfg(feature = "collisions")]
        assert_eq!(plant.geometries().len(), 1);
    }

    #[test]
    fn test_floating_base() {
        let plant = plant_from_urdf(ARM, FloatingBase::Quaternion).unwrap();
        assert_eq!(plant.num_positions(), 8);
        assert_eq!(plant.quaternion_floating_joints().count(), 1);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(plant_from_urdf("<robot", FloatingBase::Welded), Err(IkError::XmlProcessingError(_))));
        let missing_limit = ARM.replace(r#"<limit lower="${radians(-120)}" upper="2.0" effort="1" velocity="1"/>"#, "");
        assert!(matches!(plant_from_urdf(&missing_limit, FloatingBase::Welded), Err(IkError::MissingField(_))));
        let planar = ARM.replace(r#"type="fixed""#, r#"type="planar""#);
        assert!(matches!(plant_from_urdf(&planar, FloatingBase::Welded), Err(IkError::UnsupportedJoint { .. })));
    }
}
