//! Enumerated object kinds with stable wire discriminants.
//!
//! The kind is carried on every object and checked by value wherever the
//! coordinator filters which objects it mirrors, so no layer of the
//! protocol needs downcasting.

/// Concrete kind of a scene object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ObjectKind {
    Renderer = 1,
    Camera = 2,
    Volume = 3,
    Geometry = 4,
    Light = 5,
    Texture = 6,
    TransferFunction = 7,
    World = 8,
    Group = 9,
    ImageOperation = 10,
    Material = 11,
    Instance = 12,
    GeometricModel = 13,
    VolumetricModel = 14,
    Data = 15,
    FrameBuffer = 16,
    Future = 17,
}

impl ObjectKind {
    /// Wire discriminant
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    /// Parse a wire discriminant; `None` for values outside the catalog
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Renderer),
            2 => Some(Self::Camera),
            3 => Some(Self::Volume),
            4 => Some(Self::Geometry),
            5 => Some(Self::Light),
            6 => Some(Self::Texture),
            7 => Some(Self::TransferFunction),
            8 => Some(Self::World),
            9 => Some(Self::Group),
            10 => Some(Self::ImageOperation),
            11 => Some(Self::Material),
            12 => Some(Self::Instance),
            13 => Some(Self::GeometricModel),
            14 => Some(Self::VolumetricModel),
            15 => Some(Self::Data),
            16 => Some(Self::FrameBuffer),
            17 => Some(Self::Future),
            _ => None,
        }
    }

    /// Kinds the coordinator keeps a queryable mirror of: parameter and
    /// commit mutations replay on the coordinator only for these
    pub const fn mirrored_on_coordinator(self) -> bool {
        matches!(
            self,
            Self::Renderer | Self::Volume | Self::FrameBuffer | Self::Camera
        )
    }

    /// Kinds whose construction command also builds the coordinator mirror.
    /// Frame buffers and data arrays mirror through their own dedicated
    /// construction commands instead.
    pub const fn mirror_constructed(self) -> bool {
        matches!(
            self,
            Self::Renderer | Self::Volume | Self::Camera | Self::ImageOperation
        )
    }

    /// Kinds built directly rather than through the string-keyed type
    /// catalog; they exist on every process in full
    pub const fn built_directly(self) -> bool {
        matches!(self, Self::World | Self::Group)
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Renderer => "renderer",
            Self::Camera => "camera",
            Self::Volume => "volume",
            Self::Geometry => "geometry",
            Self::Light => "light",
            Self::Texture => "texture",
            Self::TransferFunction => "transfer_function",
            Self::World => "world",
            Self::Group => "group",
            Self::ImageOperation => "image_operation",
            Self::Material => "material",
            Self::Instance => "instance",
            Self::GeometricModel => "geometric_model",
            Self::VolumetricModel => "volumetric_model",
            Self::Data => "data",
            Self::FrameBuffer => "framebuffer",
            Self::Future => "future",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
