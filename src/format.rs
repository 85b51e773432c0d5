//! Texture format translation between the application graphics APIs, DXGI
//! and the compositor backend.
//!
//! The application-facing format value in `XrSwapchainCreateInfo::format` is
//! the native enum of the bound graphics API: a `DXGI_FORMAT` for D3D11 and
//! D3D12, a `VkFormat` for Vulkan and a sized `GLenum` for OpenGL. All of
//! them funnel into [`TextureFormat`](crate::backend::TextureFormat) before
//! reaching the backend, and into a DXGI format for the submission device.

use {crate::backend::TextureFormat, ash::vk};

/// A `DXGI_FORMAT` value, kept as a plain integer so the table logic stays
/// portable. The constants below mirror `dxgiformat.h`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct DxgiFormat(pub u32);

#[allow(missing_docs)]
impl DxgiFormat {
    pub const UNKNOWN: Self = Self(0);
    pub const R16G16B16A16_TYPELESS: Self = Self(9);
    pub const R16G16B16A16_FLOAT: Self = Self(10);
    pub const R32G8X24_TYPELESS: Self = Self(19);
    pub const D32_FLOAT_S8X24_UINT: Self = Self(20);
    pub const R32_FLOAT_X8X24_TYPELESS: Self = Self(21);
    pub const R11G11B10_FLOAT: Self = Self(26);
    pub const R8G8B8A8_TYPELESS: Self = Self(27);
    pub const R8G8B8A8_UNORM: Self = Self(28);
    pub const R8G8B8A8_UNORM_SRGB: Self = Self(29);
    pub const R32_TYPELESS: Self = Self(39);
    pub const D32_FLOAT: Self = Self(40);
    pub const R32_FLOAT: Self = Self(41);
    pub const R24G8_TYPELESS: Self = Self(44);
    pub const D24_UNORM_S8_UINT: Self = Self(45);
    pub const R16_TYPELESS: Self = Self(53);
    pub const D16_UNORM: Self = Self(55);
    pub const BC1_UNORM: Self = Self(71);
    pub const BC1_UNORM_SRGB: Self = Self(72);
    pub const BC2_UNORM: Self = Self(74);
    pub const BC2_UNORM_SRGB: Self = Self(75);
    pub const BC3_UNORM: Self = Self(77);
    pub const BC3_UNORM_SRGB: Self = Self(78);
    pub const B8G8R8A8_UNORM: Self = Self(87);
    pub const B8G8R8X8_UNORM: Self = Self(88);
    pub const B8G8R8A8_TYPELESS: Self = Self(90);
    pub const B8G8R8A8_UNORM_SRGB: Self = Self(91);
    pub const B8G8R8X8_TYPELESS: Self = Self(92);
    pub const B8G8R8X8_UNORM_SRGB: Self = Self(93);
    pub const BC6H_UF16: Self = Self(95);
    pub const BC6H_SF16: Self = Self(96);
    pub const BC7_UNORM: Self = Self(98);
    pub const BC7_UNORM_SRGB: Self = Self(99);
}

impl DxgiFormat {
    /// Whether hardware applies linear-to-sRGB encoding when writing.
    pub fn is_srgb(self) -> bool {
        matches!(
            self,
            Self::R8G8B8A8_UNORM_SRGB | Self::B8G8R8A8_UNORM_SRGB | Self::B8G8R8X8_UNORM_SRGB
        )
    }

    /// Whether this is a depth(-stencil) format.
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Self::D16_UNORM | Self::D24_UNORM_S8_UINT | Self::D32_FLOAT | Self::D32_FLOAT_S8X24_UINT
        )
    }

    /// The typeless family parent, used to create either-typed views over
    /// swapchain textures.
    pub fn typeless(self) -> Self {
        match self {
            Self::R8G8B8A8_UNORM | Self::R8G8B8A8_UNORM_SRGB => Self::R8G8B8A8_TYPELESS,
            Self::B8G8R8A8_UNORM | Self::B8G8R8A8_UNORM_SRGB => Self::B8G8R8A8_TYPELESS,
            Self::B8G8R8X8_UNORM | Self::B8G8R8X8_UNORM_SRGB => Self::B8G8R8X8_TYPELESS,
            Self::R16G16B16A16_FLOAT => Self::R16G16B16A16_TYPELESS,
            Self::D32_FLOAT => Self::R32_TYPELESS,
            Self::D32_FLOAT_S8X24_UINT => Self::R32G8X24_TYPELESS,
            Self::D24_UNORM_S8_UINT => Self::R24G8_TYPELESS,
            Self::D16_UNORM => Self::R16_TYPELESS,
            other => other,
        }
    }

    /// Bytes per texel for the uncompressed formats, used to size OpenGL
    /// memory-object imports.
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Self::R16G16B16A16_FLOAT | Self::D32_FLOAT_S8X24_UINT => 8,
            Self::D16_UNORM => 2,
            _ => 4,
        }
    }
}

/// Pairs of (DXGI, backend) formats, ordered the way
/// `xrEnumerateSwapchainFormats` returns them: sRGB color first, then
/// remaining color, 32-bit depth before the rest, block-compressed last.
const DXGI_TABLE: [(DxgiFormat, TextureFormat); 22] = [
    (DxgiFormat::R8G8B8A8_UNORM_SRGB, TextureFormat::R8G8B8A8UnormSrgb),
    (DxgiFormat::B8G8R8A8_UNORM_SRGB, TextureFormat::B8G8R8A8UnormSrgb),
    (DxgiFormat::R8G8B8A8_UNORM, TextureFormat::R8G8B8A8Unorm),
    (DxgiFormat::B8G8R8A8_UNORM, TextureFormat::B8G8R8A8Unorm),
    (DxgiFormat::B8G8R8X8_UNORM_SRGB, TextureFormat::B8G8R8X8UnormSrgb),
    (DxgiFormat::B8G8R8X8_UNORM, TextureFormat::B8G8R8X8Unorm),
    (DxgiFormat::R16G16B16A16_FLOAT, TextureFormat::R16G16B16A16Float),
    (DxgiFormat::D32_FLOAT, TextureFormat::D32Float),
    (DxgiFormat::D32_FLOAT_S8X24_UINT, TextureFormat::D32FloatS8X24Uint),
    (DxgiFormat::D24_UNORM_S8_UINT, TextureFormat::D24UnormS8Uint),
    (DxgiFormat::D16_UNORM, TextureFormat::D16Unorm),
    (DxgiFormat::BC1_UNORM, TextureFormat::Bc1Unorm),
    (DxgiFormat::BC1_UNORM_SRGB, TextureFormat::Bc1UnormSrgb),
    (DxgiFormat::BC2_UNORM, TextureFormat::Bc2Unorm),
    (DxgiFormat::BC2_UNORM_SRGB, TextureFormat::Bc2UnormSrgb),
    (DxgiFormat::BC3_UNORM, TextureFormat::Bc3Unorm),
    (DxgiFormat::BC3_UNORM_SRGB, TextureFormat::Bc3UnormSrgb),
    (DxgiFormat::BC6H_UF16, TextureFormat::Bc6hUf16),
    (DxgiFormat::BC6H_SF16, TextureFormat::Bc6hSf16),
    (DxgiFormat::BC7_UNORM, TextureFormat::Bc7Unorm),
    (DxgiFormat::BC7_UNORM_SRGB, TextureFormat::Bc7UnormSrgb),
    (DxgiFormat::R11G11B10_FLOAT, TextureFormat::R11G11B10Float),
];

/// Pairs of (Vulkan, backend) formats, same ordering. Vulkan has no BGRX
/// family.
const VK_TABLE: [(vk::Format, TextureFormat); 20] = [
    (vk::Format::R8G8B8A8_SRGB, TextureFormat::R8G8B8A8UnormSrgb),
    (vk::Format::B8G8R8A8_SRGB, TextureFormat::B8G8R8A8UnormSrgb),
    (vk::Format::R8G8B8A8_UNORM, TextureFormat::R8G8B8A8Unorm),
    (vk::Format::B8G8R8A8_UNORM, TextureFormat::B8G8R8A8Unorm),
    (vk::Format::R16G16B16A16_SFLOAT, TextureFormat::R16G16B16A16Float),
    (vk::Format::D32_SFLOAT, TextureFormat::D32Float),
    (vk::Format::D32_SFLOAT_S8_UINT, TextureFormat::D32FloatS8X24Uint),
    (vk::Format::D24_UNORM_S8_UINT, TextureFormat::D24UnormS8Uint),
    (vk::Format::D16_UNORM, TextureFormat::D16Unorm),
    (vk::Format::BC1_RGBA_UNORM_BLOCK, TextureFormat::Bc1Unorm),
    (vk::Format::BC1_RGBA_SRGB_BLOCK, TextureFormat::Bc1UnormSrgb),
    (vk::Format::BC2_UNORM_BLOCK, TextureFormat::Bc2Unorm),
    (vk::Format::BC2_SRGB_BLOCK, TextureFormat::Bc2UnormSrgb),
    (vk::Format::BC3_UNORM_BLOCK, TextureFormat::Bc3Unorm),
    (vk::Format::BC3_SRGB_BLOCK, TextureFormat::Bc3UnormSrgb),
    (vk::Format::BC6H_UFLOAT_BLOCK, TextureFormat::Bc6hUf16),
    (vk::Format::BC6H_SFLOAT_BLOCK, TextureFormat::Bc6hSf16),
    (vk::Format::BC7_UNORM_BLOCK, TextureFormat::Bc7Unorm),
    (vk::Format::BC7_SRGB_BLOCK, TextureFormat::Bc7UnormSrgb),
    (vk::Format::B10G11R11_UFLOAT_PACK32, TextureFormat::R11G11B10Float),
];

/// Sized OpenGL internal formats (same ordering; GL has no BGRX).
const GL_RGBA16F: u32 = 0x881A;
const GL_SRGB8_ALPHA8: u32 = 0x8C43;
const GL_RGBA8: u32 = 0x8058;
const GL_R11F_G11F_B10F: u32 = 0x8C3A;
const GL_DEPTH_COMPONENT16: u32 = 0x81A5;
const GL_DEPTH_COMPONENT32F: u32 = 0x8CAC;
const GL_DEPTH24_STENCIL8: u32 = 0x88F0;
const GL_DEPTH32F_STENCIL8: u32 = 0x8CAD;

const GL_TABLE: [(u32, TextureFormat); 8] = [
    (GL_SRGB8_ALPHA8, TextureFormat::R8G8B8A8UnormSrgb),
    (GL_RGBA8, TextureFormat::R8G8B8A8Unorm),
    (GL_RGBA16F, TextureFormat::R16G16B16A16Float),
    (GL_DEPTH_COMPONENT32F, TextureFormat::D32Float),
    (GL_DEPTH32F_STENCIL8, TextureFormat::D32FloatS8X24Uint),
    (GL_DEPTH24_STENCIL8, TextureFormat::D24UnormS8Uint),
    (GL_DEPTH_COMPONENT16, TextureFormat::D16Unorm),
    (GL_R11F_G11F_B10F, TextureFormat::R11G11B10Float),
];

/// Graphics API the application bound at session creation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GraphicsApi {
    D3D11,
    D3D12,
    Vulkan,
    OpenGL,

    /// Test-only sessions without an application device.
    Headless,
}

/// The `xrEnumerateSwapchainFormats` list for the given API, as the raw
/// `int64_t` values of that API's format enum.
pub fn supported_formats(api: GraphicsApi) -> Vec<i64> {
    match api {
        GraphicsApi::D3D11 | GraphicsApi::D3D12 | GraphicsApi::Headless => DXGI_TABLE
            .iter()
            .map(|(format, _)| format.0 as i64)
            .collect(),
        GraphicsApi::Vulkan => VK_TABLE
            .iter()
            .map(|(format, _)| format.as_raw() as i64)
            .collect(),
        GraphicsApi::OpenGL => GL_TABLE.iter().map(|(format, _)| *format as i64).collect(),
    }
}

/// Translates an application-facing format value into the backend format.
pub fn app_format_to_backend(api: GraphicsApi, format: i64) -> Option<TextureFormat> {
    match api {
        GraphicsApi::D3D11 | GraphicsApi::D3D12 | GraphicsApi::Headless => {
            let format = DxgiFormat(u32::try_from(format).ok()?);

            DXGI_TABLE
                .iter()
                .find(|(dxgi, _)| *dxgi == format)
                .map(|(_, backend)| *backend)
        }
        GraphicsApi::Vulkan => {
            let format = vk::Format::from_raw(i32::try_from(format).ok()?);

            VK_TABLE
                .iter()
                .find(|(vk, _)| *vk == format)
                .map(|(_, backend)| *backend)
        }
        GraphicsApi::OpenGL => {
            let format = u32::try_from(format).ok()?;

            GL_TABLE
                .iter()
                .find(|(gl, _)| *gl == format)
                .map(|(_, backend)| *backend)
        }
    }
}

/// The DXGI format the submission device uses for the given backend format.
pub fn backend_to_dxgi(format: TextureFormat) -> DxgiFormat {
    DXGI_TABLE
        .iter()
        .find(|(_, backend)| *backend == format)
        .map(|(dxgi, _)| *dxgi)
        .unwrap_or(DxgiFormat::UNKNOWN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn d3d_list_prioritizes_srgb_and_32_bit_depth() {
        let formats = supported_formats(GraphicsApi::D3D11);

        assert_eq!(formats[0], DxgiFormat::R8G8B8A8_UNORM_SRGB.0 as i64);
        let d32 = formats
            .iter()
            .position(|format| *format == DxgiFormat::D32_FLOAT.0 as i64)
            .unwrap();
        let d24 = formats
            .iter()
            .position(|format| *format == DxgiFormat::D24_UNORM_S8_UINT.0 as i64)
            .unwrap();

        assert!(d32 < d24);
    }

    #[test]
    pub fn every_enumerated_format_translates() {
        for api in [
            GraphicsApi::D3D11,
            GraphicsApi::D3D12,
            GraphicsApi::Vulkan,
            GraphicsApi::OpenGL,
        ] {
            for format in supported_formats(api) {
                assert!(app_format_to_backend(api, format).is_some(), "{api:?} {format}");
            }
        }
    }

    #[test]
    pub fn unknown_formats_are_rejected() {
        assert!(app_format_to_backend(GraphicsApi::D3D11, 123_456).is_none());
        assert!(app_format_to_backend(GraphicsApi::Vulkan, -1).is_none());
    }

    #[test]
    pub fn typeless_families() {
        assert_eq!(
            DxgiFormat::R8G8B8A8_UNORM_SRGB.typeless(),
            DxgiFormat::R8G8B8A8_TYPELESS
        );
        assert_eq!(
            DxgiFormat::D32_FLOAT_S8X24_UINT.typeless(),
            DxgiFormat::R32G8X24_TYPELESS
        );
        assert_eq!(DxgiFormat::BC7_UNORM.typeless(), DxgiFormat::BC7_UNORM);
    }

    #[test]
    pub fn srgb_detection() {
        assert!(DxgiFormat::R8G8B8A8_UNORM_SRGB.is_srgb());
        assert!(!DxgiFormat::R8G8B8A8_UNORM.is_srgb());
        assert!(!DxgiFormat::D32_FLOAT.is_srgb());
    }

    #[test]
    pub fn backend_round_trip() {
        for (dxgi, backend) in DXGI_TABLE {
            assert_eq!(backend_to_dxgi(backend), dxgi);
        }
    }
}
