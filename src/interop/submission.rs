//! The submission device: the runtime-internal D3D11 device the compositor
//! backend reads from.
//!
//! Created once per session on the headset's adapter. It owns the shared
//! timeline fence every bridge signals, the fixup pipelines that run between
//! release and commit, and (when a capture tool is loaded) a dummy
//! flip-model swapchain whose `Present` gives the tool frame boundaries.

use {
    super::passes::{self, SwapchainResources},
    crate::{
        error::{RuntimeError, RuntimeResult},
        fixup::CommitPlan,
        swapchain::Swapchain,
    },
    log::{error, info, warn},
    std::collections::HashMap,
    windows::{
        core::{s, Interface, PCSTR},
        Win32::{
            Foundation::{CloseHandle, GENERIC_ALL, HANDLE, HMODULE},
            Graphics::{
                Direct3D::{Fxc::D3DCompile, D3D_DRIVER_TYPE_UNKNOWN, D3D_FEATURE_LEVEL_11_0},
                Direct3D11::{
                    D3D11CreateDevice, ID3D11ComputeShader, ID3D11Device, ID3D11Device5,
                    ID3D11DeviceContext, ID3D11DeviceContext4, ID3D11Fence, ID3D11PixelShader,
                    ID3D11RasterizerState, ID3D11SamplerState, ID3D11VertexShader,
                    D3D11_COMPARISON_NEVER, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_CULL_NONE,
                    D3D11_FENCE_FLAG_SHARED, D3D11_FILL_SOLID, D3D11_FILTER_MIN_MAG_MIP_LINEAR,
                    D3D11_RASTERIZER_DESC, D3D11_SAMPLER_DESC, D3D11_SDK_VERSION,
                    D3D11_TEXTURE_ADDRESS_CLAMP,
                },
                Dxgi::{
                    Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC},
                    CreateDXGIFactory1, IDXGIAdapter1, IDXGIFactory1, IDXGIFactory2,
                    IDXGISwapChain1, DXGI_ADAPTER_DESC1, DXGI_ERROR_NOT_FOUND,
                    DXGI_SWAP_CHAIN_DESC1, DXGI_SWAP_EFFECT_FLIP_DISCARD,
                    DXGI_USAGE_RENDER_TARGET_OUTPUT,
                },
            },
            System::{
                LibraryLoader::GetModuleHandleA,
                Threading::{CreateEventA, WaitForSingleObject, INFINITE},
            },
        },
    },
};

/// Capture tools that want to observe frame boundaries.
const DEBUG_TOOL_MODULES: [PCSTR; 2] = [s!("renderdoc.dll"), s!("graphicscapture.dll")];

/// Packs a `LUID` into the `u64` the backend reports.
pub fn pack_luid(low_part: u32, high_part: i32) -> u64 {
    ((high_part as u32 as u64) << 32) | low_part as u64
}

/// The internal D3D11 device plus everything the fixup chain runs with.
pub struct SubmissionDevice {
    pub device: ID3D11Device5,
    pub context: ID3D11DeviceContext4,

    /// The shared timeline fence; one monotone value across all bridges.
    pub fence: ID3D11Fence,

    /// The exported fence handle. Kept open for the whole session: some
    /// drivers misbehave when the handle closes while OpenGL still holds
    /// the import.
    pub fence_handle: HANDLE,

    pub fence_value: u64,

    pub(super) alpha_correct: [ID3D11ComputeShader; 2],
    pub(super) depth_resolve: [ID3D11ComputeShader; 2],
    pub(super) upscale: ID3D11ComputeShader,
    pub(super) sharpen: ID3D11ComputeShader,
    pub(super) full_quad_vs: ID3D11VertexShader,
    pub(super) srgb_ps: ID3D11PixelShader,
    pub(super) sampler: ID3D11SamplerState,
    pub(super) rasterizer: ID3D11RasterizerState,

    /// Imported backend textures and view caches per swapchain.
    pub(super) resources: HashMap<u64, SwapchainResources>,

    debug_swapchain: Option<IDXGISwapChain1>,
}

impl SubmissionDevice {
    /// Brings up the device on the headset adapter. `app_api` is only used
    /// for the startup log line.
    #[profiling::function]
    pub fn new(adapter_luid: u64, app_api: &str) -> RuntimeResult<Self> {
        let factory: IDXGIFactory1 =
            unsafe { CreateDXGIFactory1() }.map_err(|err| {
                error!("CreateDXGIFactory1: {err}");

                RuntimeError::RuntimeFailure
            })?;

        let adapter = find_adapter(&factory, adapter_luid)?;

        let mut device = None;
        let mut context = None;
        unsafe {
            D3D11CreateDevice(
                &adapter,
                D3D_DRIVER_TYPE_UNKNOWN,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                Some(&[D3D_FEATURE_LEVEL_11_0]),
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
        }
        .map_err(|err| {
            error!("D3D11CreateDevice: {err}");

            RuntimeError::RuntimeFailure
        })?;

        let device: ID3D11Device = device.ok_or(RuntimeError::RuntimeFailure)?;
        let context: ID3D11DeviceContext = context.ok_or(RuntimeError::RuntimeFailure)?;

        // The fence-capable flavors of device and context.
        let device: ID3D11Device5 = device.cast().map_err(|_| RuntimeError::RuntimeFailure)?;
        let context: ID3D11DeviceContext4 =
            context.cast().map_err(|_| RuntimeError::RuntimeFailure)?;

        let fence: ID3D11Fence = unsafe { device.CreateFence(0, D3D11_FENCE_FLAG_SHARED) }
            .map_err(|_| RuntimeError::RuntimeFailure)?;

        let fence_handle = unsafe { fence.CreateSharedHandle(None, GENERIC_ALL.0, None) }
            .map_err(|_| RuntimeError::RuntimeFailure)?;

        let alpha_correct = [
            create_compute_shader(&device, passes::ALPHA_CORRECT_HLSL, s!("main"))?,
            create_compute_shader(&device, passes::ALPHA_CORRECT_HLSL, s!("mainForArray"))?,
        ];
        let depth_resolve = [
            create_compute_shader(&device, passes::DEPTH_RESOLVE_HLSL, s!("main"))?,
            create_compute_shader(&device, passes::DEPTH_RESOLVE_HLSL, s!("mainForArray"))?,
        ];
        let upscale = create_compute_shader(&device, passes::UPSCALE_HLSL, s!("main"))?;
        let sharpen = create_compute_shader(&device, passes::SHARPEN_HLSL, s!("main"))?;

        let full_quad_vs = {
            let code = compile_shader(passes::FULL_QUAD_HLSL, s!("vsMain"), s!("vs_5_0"))?;
            let mut shader = None;
            unsafe { device.CreateVertexShader(&code, None, Some(&mut shader)) }
                .map_err(|_| RuntimeError::RuntimeFailure)?;

            shader.ok_or(RuntimeError::RuntimeFailure)?
        };
        let srgb_ps = {
            let code = compile_shader(passes::FULL_QUAD_HLSL, s!("psMain"), s!("ps_5_0"))?;
            let mut shader = None;
            unsafe { device.CreatePixelShader(&code, None, Some(&mut shader)) }
                .map_err(|_| RuntimeError::RuntimeFailure)?;

            shader.ok_or(RuntimeError::RuntimeFailure)?
        };

        let sampler = {
            let desc = D3D11_SAMPLER_DESC {
                Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
                AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
                AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
                AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
                MaxAnisotropy: 1,
                ComparisonFunc: D3D11_COMPARISON_NEVER,
                MinLOD: f32::MIN,
                MaxLOD: f32::MAX,
                ..Default::default()
            };
            let mut sampler = None;
            unsafe { device.CreateSamplerState(&desc, Some(&mut sampler)) }
                .map_err(|_| RuntimeError::RuntimeFailure)?;

            sampler.ok_or(RuntimeError::RuntimeFailure)?
        };
        let rasterizer = {
            let desc = D3D11_RASTERIZER_DESC {
                FillMode: D3D11_FILL_SOLID,
                CullMode: D3D11_CULL_NONE,
                FrontCounterClockwise: true.into(),
                ..Default::default()
            };
            let mut rasterizer = None;
            unsafe { device.CreateRasterizerState(&desc, Some(&mut rasterizer)) }
                .map_err(|_| RuntimeError::RuntimeFailure)?;

            rasterizer.ok_or(RuntimeError::RuntimeFailure)?
        };

        let debug_swapchain = create_debug_swapchain(&factory, &device);

        info!("submission device up for {app_api} session");

        Ok(Self {
            device,
            context,
            fence,
            fence_handle,
            fence_value: 0,
            alpha_correct,
            depth_resolve,
            upscale,
            sharpen,
            full_quad_vs,
            srgb_ps,
            sampler,
            rasterizer,
            resources: HashMap::new(),
            debug_swapchain,
        })
    }

    /// Signals the next fence value on the submission context and blocks
    /// the host until it retires.
    #[profiling::function]
    pub fn flush(&mut self) -> RuntimeResult<()> {
        self.fence_value += 1;
        let value = self.fence_value;

        unsafe {
            self.context
                .Signal(&self.fence, value)
                .map_err(|_| RuntimeError::RuntimeFailure)?;
        }

        self.host_wait(value)
    }

    /// Blocks the host until the shared fence reaches `value`.
    pub fn host_wait(&self, value: u64) -> RuntimeResult<()> {
        if unsafe { self.fence.GetCompletedValue() } >= value {
            return Ok(());
        }

        let event = unsafe { CreateEventA(None, false, false, None) }
            .map_err(|_| RuntimeError::RuntimeFailure)?;

        unsafe {
            self.fence
                .SetEventOnCompletion(value, event)
                .map_err(|_| RuntimeError::RuntimeFailure)?;
            WaitForSingleObject(event, INFINITE);
            let _ = CloseHandle(event);
        }

        Ok(())
    }

    /// Runs one commit plan; see `passes` for the pipeline bodies.
    pub fn execute_plan(
        &mut self,
        backend: &dyn crate::backend::Backend,
        swapchain: &mut Swapchain,
        slice: u32,
        plan: &CommitPlan,
    ) -> RuntimeResult<()> {
        passes::execute(self, backend, swapchain, slice, plan)
    }

    /// Presents the dummy swapchain so an attached capture tool sees the
    /// frame boundary.
    pub fn present_debug_swapchain(&mut self) {
        if let Some(swapchain) = &self.debug_swapchain {
            unsafe {
                let _ = swapchain.Present(0, 0);
                self.context.Flush();
            }
        }
    }

    pub fn forget_swapchain(&mut self, key: u64) {
        self.resources.remove(&key);
    }
}

impl Drop for SubmissionDevice {
    fn drop(&mut self) {
        self.resources.clear();

        unsafe {
            let _ = CloseHandle(self.fence_handle);
        }
    }
}

fn find_adapter(factory: &IDXGIFactory1, adapter_luid: u64) -> RuntimeResult<IDXGIAdapter1> {
    for index in 0.. {
        let adapter: IDXGIAdapter1 = match unsafe { factory.EnumAdapters1(index) } {
            Ok(adapter) => adapter,
            Err(err) if err.code() == DXGI_ERROR_NOT_FOUND => break,
            Err(err) => {
                error!("EnumAdapters1: {err}");

                return Err(RuntimeError::RuntimeFailure);
            }
        };

        let mut desc = DXGI_ADAPTER_DESC1::default();
        unsafe { adapter.GetDesc1(&mut desc) }.map_err(|_| RuntimeError::RuntimeFailure)?;

        if pack_luid(desc.AdapterLuid.LowPart, desc.AdapterLuid.HighPart) == adapter_luid {
            let name = String::from_utf16_lossy(&desc.Description)
                .trim_end_matches('\0')
                .to_owned();
            info!("headset adapter: {name}");

            return Ok(adapter);
        }
    }

    error!("no adapter matches the headset LUID");

    Err(RuntimeError::RuntimeFailure)
}

fn compile_shader(source: &str, entry: PCSTR, target: PCSTR) -> RuntimeResult<Vec<u8>> {
    let mut blob = None;
    let mut errors = None;

    let compiled = unsafe {
        D3DCompile(
            source.as_ptr() as *const _,
            source.len(),
            None,
            None,
            None,
            entry,
            target,
            0,
            0,
            &mut blob,
            Some(&mut errors),
        )
    };

    if let Err(err) = compiled {
        if let Some(errors) = errors {
            let message = unsafe {
                std::slice::from_raw_parts(
                    errors.GetBufferPointer() as *const u8,
                    errors.GetBufferSize(),
                )
            };
            error!("D3DCompile: {}", String::from_utf8_lossy(message));
        } else {
            error!("D3DCompile: {err}");
        }

        return Err(RuntimeError::RuntimeFailure);
    }

    let blob = blob.ok_or(RuntimeError::RuntimeFailure)?;
    let code = unsafe {
        std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
    };

    Ok(code.to_vec())
}

fn create_compute_shader(
    device: &ID3D11Device5,
    source: &str,
    entry: PCSTR,
) -> RuntimeResult<ID3D11ComputeShader> {
    let code = compile_shader(source, entry, s!("cs_5_0"))?;
    let mut shader = None;

    unsafe { device.CreateComputeShader(&code, None, Some(&mut shader)) }
        .map_err(|_| RuntimeError::RuntimeFailure)?;

    shader.ok_or(RuntimeError::RuntimeFailure)
}

/// A 2x2 flip-model swapchain created only when a known capture tool is
/// loaded in-process.
fn create_debug_swapchain(
    factory: &IDXGIFactory1,
    device: &ID3D11Device5,
) -> Option<IDXGISwapChain1> {
    let tool_loaded = DEBUG_TOOL_MODULES
        .iter()
        .any(|module| unsafe { GetModuleHandleA(*module) }.is_ok());

    if !tool_loaded {
        return None;
    }

    let factory: IDXGIFactory2 = factory.cast().ok()?;
    let desc = DXGI_SWAP_CHAIN_DESC1 {
        Width: 2,
        Height: 2,
        Format: DXGI_FORMAT_B8G8R8A8_UNORM,
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
        BufferCount: 2,
        SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
        ..Default::default()
    };

    match unsafe { factory.CreateSwapChainForComposition(device, &desc, None) } {
        Ok(swapchain) => {
            info!("capture tool detected; debug swapchain created");

            Some(swapchain)
        }
        Err(err) => {
            warn!("debug swapchain: {err}");

            None
        }
    }
}
