//! Fixup pass execution on the submission device.
//!
//! [`crate::fixup`] decides *what* happens to a released image; this module
//! is the *how*: the imported-texture caches, the lazily-created views and
//! the copy/compute/draw sequences that move one released image into the
//! backend ring, with alpha correction, sRGB encoding, stencil-plane
//! dropping, MSAA resolve and optional upscaling along the way.

use {
    super::submission::SubmissionDevice,
    crate::{
        backend::Backend,
        error::{RuntimeError, RuntimeResult},
        fixup::{CommitKind, CommitPlan, UpscalePass},
        format::DxgiFormat,
        swapchain::Swapchain,
        upscale::{CasConstants, EasuConstants},
    },
    log::warn,
    windows::{
        core::Interface,
        Win32::{
            Foundation::HANDLE,
            Graphics::{
                Direct3D::D3D11_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP,
                Direct3D11::{
                    ID3D11Buffer, ID3D11RenderTargetView, ID3D11ShaderResourceView,
                    ID3D11Texture2D, ID3D11UnorderedAccessView, D3D11_BIND_CONSTANT_BUFFER,
                    D3D11_BIND_DEPTH_STENCIL, D3D11_BIND_RENDER_TARGET,
                    D3D11_BIND_SHADER_RESOURCE, D3D11_BIND_UNORDERED_ACCESS,
                    D3D11_BUFFER_DESC, D3D11_CPU_ACCESS_WRITE, D3D11_MAP_WRITE_DISCARD,
                    D3D11_RENDER_TARGET_VIEW_DESC, D3D11_RENDER_TARGET_VIEW_DESC_0,
                    D3D11_RESOURCE_MISC_SHARED_NTHANDLE, D3D11_RTV_DIMENSION_TEXTURE2D,
                    D3D11_RTV_DIMENSION_TEXTURE2DARRAY, D3D11_SHADER_RESOURCE_VIEW_DESC,
                    D3D11_SHADER_RESOURCE_VIEW_DESC_0, D3D11_SRV_DIMENSION_TEXTURE2D,
                    D3D11_SRV_DIMENSION_TEXTURE2DARRAY, D3D11_TEX2DARRAY_RTV,
                    D3D11_TEX2DARRAY_SRV, D3D11_TEX2D_RTV, D3D11_TEX2D_SRV, D3D11_TEXTURE2D_DESC,
                    D3D11_UAV_DIMENSION_TEXTURE2D, D3D11_UNORDERED_ACCESS_VIEW_DESC,
                    D3D11_UNORDERED_ACCESS_VIEW_DESC_0, D3D11_TEX2D_UAV, D3D11_USAGE_DEFAULT,
                    D3D11_USAGE_DYNAMIC, D3D11_VIEWPORT,
                },
                Dxgi::{
                    Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC},
                    IDXGIResource1, DXGI_SHARED_RESOURCE_READ, DXGI_SHARED_RESOURCE_WRITE,
                },
            },
        },
    },
};

/// Alpha-correct compute shader. The constant's bit 0 forces alpha to one,
/// bit 1 premultiplies RGB by alpha.
pub const ALPHA_CORRECT_HLSL: &str = r#"
cbuffer config : register(b0) {
    uint mode;
};

Texture2D in_texture : register(t0);
Texture2DArray in_texture_array : register(t1);
RWTexture2D<float4> out_texture : register(u0);

float4 correct(float4 color)
{
    if (mode & 2) {
        color.rgb = color.rgb * color.a;
    }
    if (mode & 1) {
        color.a = 1.0;
    }
    return color;
}

[numthreads(8, 8, 1)]
void main(uint2 pos : SV_DispatchThreadID)
{
    out_texture[pos] = correct(in_texture[pos]);
}

[numthreads(8, 8, 1)]
void mainForArray(uint2 pos : SV_DispatchThreadID)
{
    out_texture[pos] = correct(in_texture_array[float3(pos, 0)]);
}
"#;

/// Depth-resolve compute shader: keeps the depth plane, drops stencil.
pub const DEPTH_RESOLVE_HLSL: &str = r#"
Texture2D in_texture : register(t0);
Texture2DArray in_texture_array : register(t1);
RWTexture2D<float> out_texture : register(u0);

[numthreads(8, 8, 1)]
void main(uint2 pos : SV_DispatchThreadID)
{
    out_texture[pos] = in_texture[pos].x;
}

[numthreads(8, 8, 1)]
void mainForArray(uint2 pos : SV_DispatchThreadID)
{
    out_texture[pos] = in_texture_array[float3(pos, 0)].x;
}
"#;

/// Full-screen triangle plus the linear-in, encode-on-write pixel shader.
/// The render target carries the sRGB format, so the encode itself is done
/// by the output-merger.
pub const FULL_QUAD_HLSL: &str = r#"
SamplerState linear_clamp : register(s0);
Texture2D in_texture : register(t0);

void vsMain(uint id : SV_VertexID, out float4 position : SV_Position, out float2 uv : TEXCOORD0)
{
    uv = float2((id << 1) & 2, id & 2);
    position = float4(uv * float2(2, -2) + float2(-1, 1), 0, 1);
}

float4 psMain(float4 position : SV_Position, float2 uv : TEXCOORD0) : SV_Target
{
    return in_texture.Sample(linear_clamp, uv);
}
"#;

/// Edge-adaptive spatial upsampling. A condensed form of the published
/// kernel: four bilinear quad taps, blended by the local gradient so edges
/// stay crisp while flat regions interpolate smoothly.
pub const UPSCALE_HLSL: &str = r#"
cbuffer config : register(b0) {
    float4 con0;
    float4 con1;
    float4 con2;
    float4 con3;
};

SamplerState linear_clamp : register(s0);
Texture2D in_texture : register(t0);
RWTexture2D<float4> out_texture : register(u0);

[numthreads(8, 8, 1)]
void main(uint2 pos : SV_DispatchThreadID)
{
    // Output pixel center mapped into the input grid.
    float2 src = float2(pos) * con0.xy + con0.zw;
    float2 base = floor(src - 0.5) + 0.5;
    float2 frac_part = src - base;
    float2 uv = base * con1.xy;

    float4 a = in_texture.SampleLevel(linear_clamp, uv, 0);
    float4 b = in_texture.SampleLevel(linear_clamp, uv + float2(con1.z, 0), 0);
    float4 c = in_texture.SampleLevel(linear_clamp, uv + float2(0, -con1.w), 0);
    float4 d = in_texture.SampleLevel(linear_clamp, uv + float2(con1.z, -con1.w), 0);

    // Gradient magnitude drives the lerp sharpness.
    float luma_x = abs(dot(b.rgb - a.rgb, 0.333.xxx)) + abs(dot(d.rgb - c.rgb, 0.333.xxx));
    float luma_y = abs(dot(c.rgb - a.rgb, 0.333.xxx)) + abs(dot(d.rgb - b.rgb, 0.333.xxx));
    float2 w = lerp(frac_part, smoothstep(0.0, 1.0, frac_part), saturate(float2(luma_x, luma_y) * 4.0));

    float4 top = lerp(a, b, w.x);
    float4 bottom = lerp(c, d, w.x);
    out_texture[pos] = lerp(top, bottom, w.y);
}
"#;

/// Contrast-adaptive sharpening over the upscaled image.
pub const SHARPEN_HLSL: &str = r#"
cbuffer config : register(b0) {
    float peak;
};

Texture2D in_texture : register(t0);
RWTexture2D<float4> out_texture : register(u0);

[numthreads(8, 8, 1)]
void main(uint2 pos : SV_DispatchThreadID)
{
    int2 p = int2(pos);
    float3 a = in_texture[p + int2( 0, -1)].rgb;
    float3 b = in_texture[p + int2(-1,  0)].rgb;
    float4 center = in_texture[p];
    float3 c = center.rgb;
    float3 d = in_texture[p + int2( 1,  0)].rgb;
    float3 e = in_texture[p + int2( 0,  1)].rgb;

    float3 min_rgb = min(min(a, b), min(c, min(d, e)));
    float3 max_rgb = max(max(a, b), max(c, max(d, e)));

    // Weight shrinks where the neighborhood already spans a wide range.
    float3 amp = saturate(min(min_rgb, 2.0 - max_rgb) / max(max_rgb, 1e-4));
    float3 weight = sqrt(amp) * peak;

    float3 window = a + b + d + e;
    float3 sharpened = (window * weight + c) / (4.0 * weight + 1.0);
    out_texture[pos] = float4(sharpened, center.a);
}
"#;

/// Sixteen-float dynamic constant buffer, reused by every pass that needs
/// more than the alpha-correct word.
const SCALE_CONSTANTS_FLOATS: usize = 16;

/// Imported textures and view caches for one swapchain.
#[derive(Default)]
pub struct SwapchainResources {
    /// Backend ring textures, re-opened on the submission device:
    /// `[slice ring][image]`.
    slices: Vec<Vec<ID3D11Texture2D>>,

    /// Runtime-owned images the application renders into when the backend
    /// ring cannot be written directly (depth resolve, render scaling).
    private_images: Vec<ID3D11Texture2D>,

    /// NT handles for `private_images`, exported to the app-side bridges.
    pub app_handles: Vec<HANDLE>,

    /// Per-slice, per-source-image SRVs over the released image.
    srv: Vec<Vec<Option<ID3D11ShaderResourceView>>>,

    /// Per-slice, per-dest-image RTVs for the encode draw.
    rtv: Vec<Vec<Option<ID3D11RenderTargetView>>>,

    resolved: Option<Intermediate>,
    scaled: [Option<Intermediate>; 2],
    constants: Option<ID3D11Buffer>,
    scale_constants: Option<ID3D11Buffer>,
}

/// A non-sRGB texture that compute passes write and later passes read.
struct Intermediate {
    texture: ID3D11Texture2D,
    uav: ID3D11UnorderedAccessView,
    srv: ID3D11ShaderResourceView,
}

fn hr<T>(result: windows::core::Result<T>, what: &str) -> RuntimeResult<T> {
    result.map_err(|err| {
        warn!("{what}: {err}");

        RuntimeError::RuntimeFailure
    })
}

fn subresource(mip: u32, slice: u32, mip_count: u32) -> u32 {
    mip + slice * mip_count
}

impl SubmissionDevice {
    fn open_ring(
        &self,
        backend: &dyn Backend,
        swapchain: &Swapchain,
        slice: u32,
    ) -> RuntimeResult<Vec<ID3D11Texture2D>> {
        let chain = swapchain
            .chain(slice)
            .ok_or(RuntimeError::RuntimeFailure)?;
        let mut textures = Vec::with_capacity(swapchain.image_count() as usize);

        for index in 0..swapchain.image_count() {
            let handle = backend.swapchain_texture(chain, index)?;
            let texture: ID3D11Texture2D = hr(
                unsafe {
                    self.device
                        .OpenSharedResource1(HANDLE(handle.0 as *mut _))
                },
                "OpenSharedResource1",
            )?;

            textures.push(texture);
        }

        Ok(textures)
    }

    fn create_private_images(
        &self,
        swapchain: &Swapchain,
    ) -> RuntimeResult<(Vec<ID3D11Texture2D>, Vec<HANDLE>)> {
        let info = &swapchain.info;
        let format = if swapchain.need_depth_resolve {
            DxgiFormat::R32G8X24_TYPELESS
        } else {
            swapchain.submission_format.typeless()
        };
        let bind = if swapchain.need_depth_resolve {
            D3D11_BIND_DEPTH_STENCIL | D3D11_BIND_SHADER_RESOURCE
        } else {
            D3D11_BIND_RENDER_TARGET | D3D11_BIND_SHADER_RESOURCE
        };

        let desc = D3D11_TEXTURE2D_DESC {
            Width: info.width,
            Height: info.height,
            MipLevels: info.mip_count,
            ArraySize: info.array_size,
            Format: DXGI_FORMAT(format.0 as i32),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: info.sample_count,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: bind.0 as u32,
            MiscFlags: D3D11_RESOURCE_MISC_SHARED_NTHANDLE.0 as u32,
            ..Default::default()
        };

        let mut images = Vec::new();
        let mut handles = Vec::new();

        for _ in 0..swapchain.image_count() {
            let mut texture = None;
            hr(
                unsafe { self.device.CreateTexture2D(&desc, None, Some(&mut texture)) },
                "CreateTexture2D",
            )?;
            let texture: ID3D11Texture2D = texture.ok_or(RuntimeError::RuntimeFailure)?;

            let resource: IDXGIResource1 =
                texture.cast().map_err(|_| RuntimeError::RuntimeFailure)?;
            let handle = hr(
                unsafe {
                    resource.CreateSharedHandle(
                        None,
                        (DXGI_SHARED_RESOURCE_READ | DXGI_SHARED_RESOURCE_WRITE).0,
                        None,
                    )
                },
                "CreateSharedHandle",
            )?;

            images.push(texture);
            handles.push(handle);
        }

        Ok((images, handles))
    }

    /// Imports the swapchain's textures (and builds the private images) on
    /// first use.
    pub fn ensure_resources(
        &mut self,
        backend: &dyn Backend,
        swapchain: &Swapchain,
    ) -> RuntimeResult<&mut SwapchainResources> {
        let key = swapchain.primary_chain().0;

        if !self.resources.contains_key(&key) {
            let slice_count = swapchain.info.array_size as usize;
            let mut resources = SwapchainResources {
                slices: vec![Vec::new(); slice_count],
                srv: vec![vec![None; swapchain.image_count() as usize]; slice_count],
                rtv: vec![vec![None; swapchain.image_count() as usize]; slice_count],
                ..Default::default()
            };

            resources.slices[0] = self.open_ring(backend, swapchain, 0)?;

            if swapchain.uses_private_images() {
                let (images, handles) = self.create_private_images(swapchain)?;
                resources.private_images = images;
                resources.app_handles = handles;
            }

            self.resources.insert(key, resources);
        }

        Ok(self.resources.get_mut(&key).expect("inserted above"))
    }

    /// Shared handles the app-side bridge re-opens for this swapchain: the
    /// backend's own texture handles normally, the private images' handles
    /// when the runtime interposes between application and ring.
    pub fn export_handles(
        &mut self,
        backend: &dyn Backend,
        swapchain: &Swapchain,
    ) -> RuntimeResult<Vec<HANDLE>> {
        self.ensure_resources(backend, swapchain)?;

        if swapchain.uses_private_images() {
            let resources = &self.resources[&swapchain.primary_chain().0];

            return Ok(resources.app_handles.clone());
        }

        (0..swapchain.image_count())
            .map(|index| {
                backend
                    .swapchain_texture(swapchain.primary_chain(), index)
                    .map(|handle| HANDLE(handle.0 as *mut _))
                    .map_err(RuntimeError::from)
            })
            .collect()
    }

    fn constants_buffer(&self, bytes: u32) -> RuntimeResult<ID3D11Buffer> {
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: bytes.max(16),
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_CONSTANT_BUFFER.0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            ..Default::default()
        };
        let mut buffer = None;

        hr(
            unsafe { self.device.CreateBuffer(&desc, None, Some(&mut buffer)) },
            "CreateBuffer",
        )?;

        buffer.ok_or(RuntimeError::RuntimeFailure)
    }

    fn write_constants(&self, buffer: &ID3D11Buffer, bytes: &[u8]) -> RuntimeResult<()> {
        let mut mapped = Default::default();

        hr(
            unsafe {
                self.context
                    .Map(buffer, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped))
            },
            "Map",
        )?;

        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.pData as *mut u8, bytes.len());
            self.context.Unmap(buffer, 0);
        }

        Ok(())
    }

    fn intermediate(
        &self,
        width: u32,
        height: u32,
        format: DxgiFormat,
        view_format: DxgiFormat,
    ) -> RuntimeResult<Intermediate> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT(format.0 as i32),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_SHADER_RESOURCE | D3D11_BIND_UNORDERED_ACCESS).0 as u32,
            ..Default::default()
        };
        let mut texture = None;
        hr(
            unsafe { self.device.CreateTexture2D(&desc, None, Some(&mut texture)) },
            "CreateTexture2D",
        )?;
        let texture: ID3D11Texture2D = texture.ok_or(RuntimeError::RuntimeFailure)?;

        let uav_desc = D3D11_UNORDERED_ACCESS_VIEW_DESC {
            Format: DXGI_FORMAT(view_format.0 as i32),
            ViewDimension: D3D11_UAV_DIMENSION_TEXTURE2D,
            Anonymous: D3D11_UNORDERED_ACCESS_VIEW_DESC_0 {
                Texture2D: D3D11_TEX2D_UAV { MipSlice: 0 },
            },
        };
        let mut uav = None;
        hr(
            unsafe {
                self.device
                    .CreateUnorderedAccessView(&texture, Some(&uav_desc), Some(&mut uav))
            },
            "CreateUnorderedAccessView",
        )?;

        let srv_desc = D3D11_SHADER_RESOURCE_VIEW_DESC {
            Format: DXGI_FORMAT(view_format.0 as i32),
            ViewDimension: D3D11_SRV_DIMENSION_TEXTURE2D,
            Anonymous: D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture2D: D3D11_TEX2D_SRV {
                    MostDetailedMip: 0,
                    MipLevels: 1,
                },
            },
        };
        let mut srv = None;
        hr(
            unsafe {
                self.device
                    .CreateShaderResourceView(&texture, Some(&srv_desc), Some(&mut srv))
            },
            "CreateShaderResourceView",
        )?;

        Ok(Intermediate {
            texture,
            uav: uav.ok_or(RuntimeError::RuntimeFailure)?,
            srv: srv.ok_or(RuntimeError::RuntimeFailure)?,
        })
    }

    fn unbind_compute(&self) {
        let null_uav: [Option<ID3D11UnorderedAccessView>; 1] = [None];

        unsafe {
            self.context.CSSetShader(None, None);
            self.context.CSSetConstantBuffers(0, Some(&[None]));
            self.context
                .CSSetUnorderedAccessViews(0, 1, Some(null_uav.as_ptr()), None);
            self.context.CSSetShaderResources(0, Some(&[None, None]));
        }
    }

    fn dispatch_over(&self, width: u32, height: u32) {
        unsafe {
            self.context
                .Dispatch(width.div_ceil(8), height.div_ceil(8), 1);
        }
    }

    /// The linear-to-sRGB (or plain format-conversion) full-screen draw.
    fn encode_draw(
        &self,
        source: &ID3D11ShaderResourceView,
        target: &ID3D11RenderTargetView,
        width: u32,
        height: u32,
    ) {
        unsafe {
            self.context.ClearState();
            self.context
                .IASetPrimitiveTopology(D3D11_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP);
            self.context
                .OMSetRenderTargets(Some(&[Some(target.clone())]), None);
            self.context.RSSetState(&self.rasterizer);
            self.context.RSSetViewports(Some(&[D3D11_VIEWPORT {
                TopLeftX: 0.0,
                TopLeftY: 0.0,
                Width: width as f32,
                Height: height as f32,
                MinDepth: 0.0,
                MaxDepth: 1.0,
            }]));
            self.context.VSSetShader(&self.full_quad_vs, None);
            self.context
                .PSSetSamplers(0, Some(&[Some(self.sampler.clone())]));
            self.context
                .PSSetShaderResources(0, Some(&[Some(source.clone())]));
            self.context.PSSetShader(&self.srgb_ps, None);
            self.context.Draw(3, 0);

            self.context.OMSetRenderTargets(Some(&[None]), None);
            self.context.PSSetShaderResources(0, Some(&[None]));
        }
    }
}

/// Runs one commit plan. The caller commits the backend ring afterwards.
#[profiling::function]
pub fn execute(
    submission: &mut SubmissionDevice,
    backend: &dyn Backend,
    swapchain: &mut Swapchain,
    slice: u32,
    plan: &CommitPlan,
) -> RuntimeResult<()> {
    submission.ensure_resources(backend, swapchain)?;

    let key = swapchain.primary_chain().0;
    let mut resources = submission
        .resources
        .remove(&key)
        .expect("ensured above");

    let result = execute_with(submission, backend, swapchain, slice, plan, &mut resources);

    submission.resources.insert(key, resources);

    result
}

fn execute_with(
    submission: &mut SubmissionDevice,
    backend: &dyn Backend,
    swapchain: &mut Swapchain,
    slice: u32,
    plan: &CommitPlan,
    resources: &mut SwapchainResources,
) -> RuntimeResult<()> {
    let slice_index = slice as usize;
    let info = swapchain.info;

    // Import the lazily-created slice ring on first touch.
    if slice > 0 && resources.slices[slice_index].is_empty() {
        resources.slices[slice_index] = submission.open_ring(backend, swapchain, slice)?;
    }

    let dest_index = backend.swapchain_current_index(
        swapchain.chain(slice).ok_or(RuntimeError::RuntimeFailure)?,
    )? as usize;
    let dest = resources.slices[slice_index][dest_index].clone();

    match plan.kind {
        CommitKind::Direct => {
            if let Some(upscale) = &plan.upscale {
                let source_index = swapchain_source_index(plan);
                let source = source_texture(resources, swapchain, source_index);
                let srv = source_srv(
                    submission,
                    resources,
                    swapchain,
                    &source,
                    slice,
                    source_index,
                    swapchain.submission_format,
                )?;

                run_upscale(
                    submission, resources, swapchain, &srv, slice, &dest, dest_index, upscale,
                )?;
            }

            // Otherwise the application rendered straight into the backend
            // texture; nothing to do before commit.
        }
        CommitKind::Copy { source_index } => {
            let source = source_texture(resources, swapchain, source_index as usize);

            if let Some(upscale) = &plan.upscale {
                // Replays also re-run the scaler: the ring advanced on
                // commit, so the previous result lives in a retired image.
                let srv = source_srv(
                    submission,
                    resources,
                    swapchain,
                    &source,
                    slice,
                    source_index as usize,
                    swapchain.submission_format,
                )?;

                run_upscale(
                    submission, resources, swapchain, &srv, slice, &dest, dest_index, upscale,
                )?;
            } else if plan.msaa_resolve {
                unsafe {
                    submission.context.ResolveSubresource(
                        &dest,
                        0,
                        &source,
                        subresource(0, slice, info.mip_count),
                        DXGI_FORMAT(swapchain.submission_format.0 as i32),
                    );
                }
            } else {
                unsafe {
                    submission.context.CopySubresourceRegion(
                        &dest,
                        0,
                        0,
                        0,
                        0,
                        &source,
                        subresource(0, slice, info.mip_count),
                        None,
                    );
                }
            }
        }
        CommitKind::AlphaCorrect {
            constants,
            array_shader,
            srgb_finish,
            source_index,
        } => {
            ensure_alpha_resources(submission, resources, swapchain)?;

            let source = source_texture(resources, swapchain, source_index as usize);
            let srv = source_srv(
                submission,
                resources,
                swapchain,
                &source,
                slice,
                source_index as usize,
                swapchain.submission_format,
            )?;

            let buffer = resources.constants.as_ref().expect("ensured above");
            submission.write_constants(buffer, &constants.to_le_bytes())?;

            let resolved = resources.resolved.as_ref().expect("ensured above");
            let shader = &submission.alpha_correct[usize::from(array_shader)];

            unsafe {
                submission
                    .context
                    .CSSetConstantBuffers(0, Some(&[Some(buffer.clone())]));
                submission.context.CSSetShader(shader, None);

                // t0 feeds the Tex2D variant, t1 the array variant.
                let views = if array_shader {
                    [None, Some(srv.clone())]
                } else {
                    [Some(srv.clone()), None]
                };
                submission.context.CSSetShaderResources(0, Some(&views));
                let uavs = [Some(resolved.uav.clone())];
                submission
                    .context
                    .CSSetUnorderedAccessViews(0, 1, Some(uavs.as_ptr()), None);
            }

            submission.dispatch_over(info.width, info.height);
            submission.unbind_compute();

            if let Some(upscale) = &plan.upscale {
                let resolved_srv = resources.resolved.as_ref().unwrap().srv.clone();
                run_upscale(
                    submission,
                    resources,
                    swapchain,
                    &resolved_srv,
                    slice,
                    &dest,
                    dest_index,
                    upscale,
                )?;
            } else if srgb_finish {
                let rtv = dest_rtv(submission, resources, swapchain, &dest, slice, dest_index)?;
                let resolved = resources.resolved.as_ref().unwrap();

                submission.encode_draw(
                    &resolved.srv,
                    &rtv,
                    swapchain.backend_desc.width,
                    swapchain.backend_desc.height,
                );
            } else {
                let resolved = resources.resolved.as_ref().unwrap();

                unsafe {
                    submission.context.CopySubresourceRegion(
                        &dest,
                        0,
                        0,
                        0,
                        0,
                        &resolved.texture,
                        0,
                        None,
                    );
                }
            }
        }
        CommitKind::DepthResolve { source_index } => {
            ensure_alpha_resources(submission, resources, swapchain)?;

            let source = source_texture(resources, swapchain, source_index as usize);
            let srv = source_srv(
                submission,
                resources,
                swapchain,
                &source,
                slice,
                source_index as usize,
                DxgiFormat::R32_FLOAT_X8X24_TYPELESS,
            )?;

            let resolved = resources.resolved.as_ref().expect("ensured above");
            let shader = &submission.depth_resolve[usize::from(info.array_size > 1)];

            unsafe {
                submission.context.CSSetShader(shader, None);
                let views = if info.array_size > 1 {
                    [None, Some(srv.clone())]
                } else {
                    [Some(srv.clone()), None]
                };
                submission.context.CSSetShaderResources(0, Some(&views));
                let uavs = [Some(resolved.uav.clone())];
                submission
                    .context
                    .CSSetUnorderedAccessViews(0, 1, Some(uavs.as_ptr()), None);
            }

            submission.dispatch_over(info.width, info.height);
            submission.unbind_compute();

            unsafe {
                submission.context.CopySubresourceRegion(
                    &dest,
                    0,
                    0,
                    0,
                    0,
                    &resources.resolved.as_ref().unwrap().texture,
                    0,
                    None,
                );
            }
        }
    }

    Ok(())
}

/// Where the released pixels live: the private images when the runtime owns
/// the app-facing ring, slice 0 of the backend ring otherwise.
fn source_texture(
    resources: &SwapchainResources,
    swapchain: &Swapchain,
    index: usize,
) -> ID3D11Texture2D {
    if swapchain.uses_private_images() {
        resources.private_images[index].clone()
    } else {
        resources.slices[0][index].clone()
    }
}

fn swapchain_source_index(plan: &CommitPlan) -> usize {
    match plan.kind {
        CommitKind::Direct => 0,
        CommitKind::Copy { source_index }
        | CommitKind::AlphaCorrect { source_index, .. }
        | CommitKind::DepthResolve { source_index } => source_index as usize,
    }
}

/// The resolved intermediate, constant buffer and UAV shared by the compute
/// branches.
fn ensure_alpha_resources(
    submission: &SubmissionDevice,
    resources: &mut SwapchainResources,
    swapchain: &Swapchain,
) -> RuntimeResult<()> {
    if resources.resolved.is_none() {
        let (texture_format, view_format) = if swapchain.need_depth_resolve {
            (DxgiFormat::R32_TYPELESS, DxgiFormat::R32_FLOAT)
        } else if swapchain.submission_format.is_srgb() {
            // Compute cannot write sRGB; detour through a wide intermediate.
            (
                DxgiFormat::R16G16B16A16_TYPELESS,
                DxgiFormat::R16G16B16A16_FLOAT,
            )
        } else {
            (
                swapchain.submission_format.typeless(),
                swapchain.submission_format,
            )
        };

        resources.resolved = Some(submission.intermediate(
            swapchain.info.width,
            swapchain.info.height,
            texture_format,
            view_format,
        )?);
    }

    if resources.constants.is_none() {
        resources.constants = Some(submission.constants_buffer(16)?);
    }

    Ok(())
}

/// Lazily-created SRV over one source image at one slice.
fn source_srv(
    submission: &SubmissionDevice,
    resources: &mut SwapchainResources,
    swapchain: &Swapchain,
    source: &ID3D11Texture2D,
    slice: u32,
    source_index: usize,
    format: DxgiFormat,
) -> RuntimeResult<ID3D11ShaderResourceView> {
    let cache = &mut resources.srv[slice as usize];

    if cache[source_index].is_none() {
        let array = swapchain.info.array_size > 1;
        let desc = D3D11_SHADER_RESOURCE_VIEW_DESC {
            Format: DXGI_FORMAT(format.0 as i32),
            ViewDimension: if array {
                D3D11_SRV_DIMENSION_TEXTURE2DARRAY
            } else {
                D3D11_SRV_DIMENSION_TEXTURE2D
            },
            Anonymous: if array {
                D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
                    Texture2DArray: D3D11_TEX2DARRAY_SRV {
                        MostDetailedMip: 0,
                        MipLevels: swapchain.info.mip_count,
                        FirstArraySlice: slice,
                        ArraySize: 1,
                    },
                }
            } else {
                D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
                    Texture2D: D3D11_TEX2D_SRV {
                        MostDetailedMip: 0,
                        MipLevels: swapchain.info.mip_count,
                    },
                }
            },
        };

        let mut srv = None;
        hr(
            unsafe {
                submission
                    .device
                    .CreateShaderResourceView(source, Some(&desc), Some(&mut srv))
            },
            "CreateShaderResourceView",
        )?;

        cache[source_index] = srv;
    }

    Ok(cache[source_index].clone().expect("created above"))
}

/// Lazily-created RTV over the backend image the encode draw writes.
fn dest_rtv(
    submission: &SubmissionDevice,
    resources: &mut SwapchainResources,
    swapchain: &Swapchain,
    dest: &ID3D11Texture2D,
    slice: u32,
    dest_index: usize,
) -> RuntimeResult<ID3D11RenderTargetView> {
    let cache = &mut resources.rtv[slice as usize];

    if cache[dest_index].is_none() {
        // Slice rings above zero are single-layer by construction.
        let array = swapchain.info.array_size > 1 && slice == 0;
        let desc = D3D11_RENDER_TARGET_VIEW_DESC {
            Format: DXGI_FORMAT(swapchain.submission_format.0 as i32),
            ViewDimension: if array {
                D3D11_RTV_DIMENSION_TEXTURE2DARRAY
            } else {
                D3D11_RTV_DIMENSION_TEXTURE2D
            },
            Anonymous: if array {
                D3D11_RENDER_TARGET_VIEW_DESC_0 {
                    Texture2DArray: D3D11_TEX2DARRAY_RTV {
                        MipSlice: 0,
                        FirstArraySlice: slice,
                        ArraySize: 1,
                    },
                }
            } else {
                D3D11_RENDER_TARGET_VIEW_DESC_0 {
                    Texture2D: D3D11_TEX2D_RTV { MipSlice: 0 },
                }
            },
        };

        let mut rtv = None;
        hr(
            unsafe {
                submission
                    .device
                    .CreateRenderTargetView(dest, Some(&desc), Some(&mut rtv))
            },
            "CreateRenderTargetView",
        )?;

        cache[dest_index] = rtv;
    }

    Ok(cache[dest_index].clone().expect("created above"))
}

/// The upscale (and optional sharpen) chain, finishing with the encode draw
/// into the backend image.
#[allow(clippy::too_many_arguments)]
fn run_upscale(
    submission: &SubmissionDevice,
    resources: &mut SwapchainResources,
    swapchain: &Swapchain,
    source: &ID3D11ShaderResourceView,
    slice: u32,
    dest: &ID3D11Texture2D,
    dest_index: usize,
    upscale: &UpscalePass,
) -> RuntimeResult<()> {
    let (out_width, out_height) = upscale.output;

    // Output-sized 16-bit-float intermediates, one per stage.
    for intermediate in resources.scaled.iter_mut() {
        if intermediate.is_none() {
            *intermediate = Some(submission.intermediate(
                out_width,
                out_height,
                DxgiFormat::R16G16B16A16_TYPELESS,
                DxgiFormat::R16G16B16A16_FLOAT,
            )?);
        }
    }

    if resources.scale_constants.is_none() {
        resources.scale_constants =
            Some(submission.constants_buffer((SCALE_CONSTANTS_FLOATS * 4) as u32)?);
    }

    let constants = resources.scale_constants.as_ref().expect("ensured above");
    let easu = EasuConstants::new(upscale.input, upscale.output);
    let mut bytes = Vec::with_capacity(SCALE_CONSTANTS_FLOATS * 4);
    for row in [easu.con0, easu.con1, easu.con2, easu.con3] {
        for value in row {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    submission.write_constants(constants, &bytes)?;

    let [first, second] = &resources.scaled;
    let first = first.as_ref().expect("ensured above");
    let second = second.as_ref().expect("ensured above");

    unsafe {
        submission
            .context
            .CSSetConstantBuffers(0, Some(&[Some(constants.clone())]));
        submission.context.CSSetShader(&submission.upscale, None);
        submission
            .context
            .CSSetShaderResources(0, Some(&[Some(source.clone())]));
        let uavs = [Some(first.uav.clone())];
        submission
            .context
            .CSSetUnorderedAccessViews(0, 1, Some(uavs.as_ptr()), None);
    }
    submission.dispatch_over(out_width, out_height);
    submission.unbind_compute();

    let last = if upscale.sharpen > 0.0 {
        let cas = CasConstants::new(upscale.sharpen);
        submission.write_constants(constants, &cas.peak.to_le_bytes())?;

        unsafe {
            submission
                .context
                .CSSetConstantBuffers(0, Some(&[Some(constants.clone())]));
            submission.context.CSSetShader(&submission.sharpen, None);
            submission
                .context
                .CSSetShaderResources(0, Some(&[Some(first.srv.clone())]));
            let uavs = [Some(second.uav.clone())];
            submission
                .context
                .CSSetUnorderedAccessViews(0, 1, Some(uavs.as_ptr()), None);
        }
        submission.dispatch_over(out_width, out_height);
        submission.unbind_compute();

        second
    } else {
        first
    };
    let last_srv = last.srv.clone();

    let rtv = dest_rtv(submission, resources, swapchain, dest, slice, dest_index)?;
    submission.encode_draw(&last_srv, &rtv, out_width, out_height);

    Ok(())
}
