use glam::{Quat, Vec2, Vec3};

/// ABI boolean. `0` is false, anything else is true.
pub type FinchBool = u8;

pub const FINCH_TRUE: FinchBool = 1;
pub const FINCH_FALSE: FinchBool = 0;

/// Convert a native bool into the ABI boolean.
pub fn to_finch_bool(value: bool) -> FinchBool {
    if value {
        FINCH_TRUE
    } else {
        FINCH_FALSE
    }
}

/// 2D vector (touch axes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vector2 {
    pub x: f32,
    pub y: f32,
}

/// 3D vector in meters (positions) or per-second units (velocities).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Rotation quaternion, field order x, y, z, w.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Vector2 {
    pub const ZERO: Vector2 = Vector2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl Vector3 {
    pub const ZERO: Vector3 = Vector3 { x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

/// Declares a `u8`-backed ABI enumeration with its `Last` sentinel.
///
/// Raw values cross the boundary only through `from_raw`/`as_raw`, so an
/// out-of-range byte from the host never becomes an invalid enum value.
macro_rules! abi_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident (last = $last:expr) {
            $( $(#[$vmeta:meta])* $variant:ident = $value:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            /// Sentinel value; `Unknown` aliases it.
            pub const LAST: u8 = $last;
            pub const UNKNOWN: u8 = $last;
            /// Every named variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Decode a raw ABI value. Sentinels and unknown values yield `None`.
            pub fn from_raw(raw: u8) -> Option<Self> {
                match raw {
                    $( v if v == $value => Some($name::$variant), )+
                    _ => None,
                }
            }

            pub fn as_raw(self) -> u8 {
                self as u8
            }
        }
    };
}

abi_enum! {
    /// Status of `Init`.
    pub enum InitError (last = 5) {
        None = 0,
        AlreadyInitialized = 1,
        NotInitialized = 2,
        IllegalArgument = 3,
        RuntimeError = 4,
    }
}

abi_enum! {
    /// Status of the update family.
    pub enum UpdateError (last = 4) {
        None = 0,
        NotInitialized = 1,
        IllegalArgument = 2,
        RuntimeError = 3,
    }
}

abi_enum! {
    /// Status of node I/O.
    pub enum IoError (last = 4) {
        None = 0,
        NotInitialized = 1,
        IllegalArgument = 2,
        RuntimeError = 3,
    }
}

abi_enum! {
    /// Body-relative slot a node occupies.
    pub enum NodeType (last = 4) {
        RightHand = 0,
        LeftHand = 1,
        RightUpperArm = 2,
        LeftUpperArm = 3,
    }
}

abi_enum! {
    /// Handedness selector.
    pub enum Chirality (last = 2) {
        Right = 0,
        Left = 1,
        Both = 255,
    }
}

abi_enum! {
    pub enum ControllerType (last = 5) {
        Hand = 0,
        Shift = 1,
        WaveVRDash = 2,
        Dash = 3,
        UniversalController = 4,
    }
}

abi_enum! {
    pub enum NodesStateType (last = 2) {
        Connected = 0,
        Correctly = 1,
    }
}

abi_enum! {
    /// Controller element; the value is its bit in [`Events`].
    pub enum ControllerElement (last = 16) {
        ButtonOne = 0,
        ButtonTwo = 1,
        ButtonThree = 2,
        ButtonFour = 3,
        IndexTrigger = 4,
        ButtonGrip = 5,
        LeftProximity = 6,
        ButtonZero = 7,
        RightProximity = 8,
        ButtonThumb = 9,
        LedChirality = 10,
        IsTouchpadNotAvailable = 11,
        IsLedOn = 12,
        Touch = 15,
    }
}

abi_enum! {
    pub enum EventType (last = 3) {
        Begin = 0,
        Process = 1,
        End = 2,
    }
}

abi_enum! {
    pub enum RecenterMode (last = 2) {
        Forward = 0,
        HmdRotation = 1,
    }
}

abi_enum! {
    pub enum BodyRotationMode (last = 7) {
        None = 0,
        ShoulderRotation = 1,
        HandRotation = 2,
        HandMotion = 3,
        HmdRotation = 4,
        ShoulderRotationWithReachout = 5,
        FullBodyRotation = 6,
    }
}

abi_enum! {
    pub enum AxisCalibrationStep (last = 4) {
        One = 0,
        Two = 1,
        Three = 2,
        Four = 3,
    }
}

abi_enum! {
    /// Skeleton bone used for full-body pose output.
    pub enum Bone (last = 70) {
        Hips = 0,
        LeftUpperLeg = 1,
        RightUpperLeg = 2,
        LeftLowerLeg = 3,
        RightLowerLeg = 4,
        LeftFoot = 5,
        RightFoot = 6,
        Spine = 7,
        Chest = 8,
        Neck = 9,
        Head = 10,
        LeftShoulder = 11,
        RightShoulder = 12,
        LeftUpperArm = 13,
        RightUpperArm = 14,
        LeftLowerArm = 15,
        RightLowerArm = 16,
        LeftHand = 17,
        RightHand = 18,
        LeftToes = 19,
        RightToes = 20,
        LeftEye = 21,
        RightEye = 22,
        Jaw = 23,
        LeftThumbProximal = 24,
        LeftThumbIntermediate = 25,
        LeftThumbDistal = 26,
        LeftIndexProximal = 27,
        LeftIndexIntermediate = 28,
        LeftIndexDistal = 29,
        LeftMiddleProximal = 30,
        LeftMiddleIntermediate = 31,
        LeftMiddleDistal = 32,
        LeftRingProximal = 33,
        LeftRingIntermediate = 34,
        LeftRingDistal = 35,
        LeftLittleProximal = 36,
        LeftLittleIntermediate = 37,
        LeftLittleDistal = 38,
        RightThumbProximal = 39,
        RightThumbIntermediate = 40,
        RightThumbDistal = 41,
        RightIndexProximal = 42,
        RightIndexIntermediate = 43,
        RightIndexDistal = 44,
        RightMiddleProximal = 45,
        RightMiddleIntermediate = 46,
        RightMiddleDistal = 47,
        RightRingProximal = 48,
        RightRingIntermediate = 49,
        RightRingDistal = 50,
        RightLittleProximal = 51,
        RightLittleIntermediate = 52,
        RightLittleDistal = 53,
        LeftHandCenter = 54,
        LeftThumbTip = 55,
        LeftIndexTip = 56,
        LeftMiddleTip = 57,
        LeftRingTip = 58,
        LeftLittleTip = 59,
        RightHandCenter = 60,
        RightThumbTip = 61,
        RightIndexTip = 62,
        RightMiddleTip = 63,
        RightRingTip = 64,
        RightLittleTip = 65,
        LeftClavicleBase = 66,
        RightClavicleBase = 67,
        LeftClavicleOffset = 68,
        RightClavicleOffset = 69,
    }
}

abi_enum! {
    /// Host environment the core is embedded in.
    pub enum Platform (last = 5) {
        External = 0,
        Internal = 1,
        Unity3D = 2,
        UnrealEngine4 = 3,
        WaveVR = 4,
    }
}

abi_enum! {
    pub enum ScannerType (last = 4) {
        None = 0,
        Bonded = 1,
        /// Bonded and advertising, bonded first.
        BA = 2,
        /// Advertising and bonded, advertising first.
        AB = 3,
    }
}

abi_enum! {
    pub enum UpdateType (last = 3) {
        Internal = 0,
        HmdRotation = 1,
        HmdTransform = 2,
    }
}

impl NodeType {
    pub const COUNT: usize = NodeType::LAST as usize;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Side of the body the slot belongs to.
    pub fn chirality(self) -> Chirality {
        match self {
            NodeType::RightHand | NodeType::RightUpperArm => Chirality::Right,
            NodeType::LeftHand | NodeType::LeftUpperArm => Chirality::Left,
        }
    }

    pub fn is_upper_arm(self) -> bool {
        matches!(self, NodeType::RightUpperArm | NodeType::LeftUpperArm)
    }

    pub fn hand(side: Chirality) -> Option<NodeType> {
        match side {
            Chirality::Right => Some(NodeType::RightHand),
            Chirality::Left => Some(NodeType::LeftHand),
            Chirality::Both => None,
        }
    }

    pub fn upper_arm(side: Chirality) -> Option<NodeType> {
        match side {
            Chirality::Right => Some(NodeType::RightUpperArm),
            Chirality::Left => Some(NodeType::LeftUpperArm),
            Chirality::Both => None,
        }
    }
}

impl Chirality {
    /// The concrete sides this selector names.
    pub fn sides(self) -> &'static [Chirality] {
        match self {
            Chirality::Right => &[Chirality::Right],
            Chirality::Left => &[Chirality::Left],
            Chirality::Both => &[Chirality::Right, Chirality::Left],
        }
    }

    /// Array index for per-side storage; `None` for `Both`.
    pub fn index(self) -> Option<usize> {
        match self {
            Chirality::Right => Some(0),
            Chirality::Left => Some(1),
            Chirality::Both => None,
        }
    }

    pub fn opposite(self) -> Chirality {
        match self {
            Chirality::Right => Chirality::Left,
            Chirality::Left => Chirality::Right,
            Chirality::Both => Chirality::Both,
        }
    }

    /// +1 for right, -1 for left along the body x axis.
    pub fn sign(self) -> f32 {
        match self {
            Chirality::Left => -1.0,
            _ => 1.0,
        }
    }
}

impl ControllerElement {
    pub fn bit(self) -> Events {
        Events::from_bits_retain(1 << (self as u16))
    }
}

impl Bone {
    pub const COUNT: usize = Bone::LAST as usize;

    pub fn index(self) -> usize {
        self as usize
    }
}

bitflags::bitflags! {
    /// Connection and data-validity flags for the four node slots.
    ///
    /// Bit `node * NodesStateType::LAST + state`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(C)]
    pub struct NodesState: u8 {
        const RIGHT_HAND_CONNECTED      = 1 << 0;
        const RIGHT_HAND_CORRECTLY      = 1 << 1;
        const LEFT_HAND_CONNECTED       = 1 << 2;
        const LEFT_HAND_CORRECTLY       = 1 << 3;
        const RIGHT_UPPER_ARM_CONNECTED = 1 << 4;
        const RIGHT_UPPER_ARM_CORRECTLY = 1 << 5;
        const LEFT_UPPER_ARM_CONNECTED  = 1 << 6;
        const LEFT_UPPER_ARM_CORRECTLY  = 1 << 7;
    }
}

impl NodesState {
    pub fn flag(node: NodeType, state: NodesStateType) -> NodesState {
        let bit = node as u8 * NodesStateType::LAST + state as u8;
        NodesState::from_bits_retain(1 << bit)
    }

    pub fn get(self, node: NodeType, state: NodesStateType) -> bool {
        self.contains(Self::flag(node, state))
    }
}

bitflags::bitflags! {
    /// Per-node element event bits, one per [`ControllerElement`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(C)]
    pub struct Events: u16 {
        const BUTTON_ONE                = 1 << 0;
        const BUTTON_TWO                = 1 << 1;
        const BUTTON_THREE              = 1 << 2;
        const BUTTON_FOUR               = 1 << 3;
        const INDEX_TRIGGER             = 1 << 4;
        const BUTTON_GRIP               = 1 << 5;
        const LEFT_PROXIMITY            = 1 << 6;
        const BUTTON_ZERO               = 1 << 7;
        const RIGHT_PROXIMITY           = 1 << 8;
        const BUTTON_THUMB              = 1 << 9;
        const LED_CHIRALITY             = 1 << 10;
        const IS_TOUCHPAD_NOT_AVAILABLE = 1 << 11;
        const IS_LED_ON                 = 1 << 12;
        const TOUCH                     = 1 << 15;
    }
}

bitflags::bitflags! {
    /// Slots filled during a scan.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(C)]
    pub struct ScanResult: u8 {
        const RIGHT_HAND      = 1 << 0;
        const LEFT_HAND       = 1 << 1;
        const RIGHT_UPPER_ARM = 1 << 2;
        const LEFT_UPPER_ARM  = 1 << 3;
    }
}

impl ScanResult {
    pub fn node(node: NodeType) -> ScanResult {
        ScanResult::from_bits_retain(1 << node as u8)
    }
}

/// Identity strings and USB/BT device-information ids of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub address: String,
    pub manufacturer_name: String,
    pub model_number: String,
    pub serial_number: String,
    pub hardware_revision: String,
    pub firmware_revision: String,
    pub software_revision: String,
    pub vendor_id_source: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_version: u16,
}

/// One decoded node report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeSample {
    /// Node clock in milliseconds.
    pub time_ms: u64,
    /// Orientation as measured, before any calibration.
    pub rotation: Quat,
    /// Specific force in m/s^2, node frame.
    pub acceleration: Vec3,
    /// Angular velocity in rad/s, node frame.
    pub angular_velocity: Vec3,
    pub elements: Events,
    pub touch: Vec2,
    /// Index trigger [0..1].
    pub trigger: f32,
    /// Battery charge in percent.
    pub charge: u8,
}
