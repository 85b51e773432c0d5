//! OpenGL (Win32) application bridge.
//!
//! OpenGL reaches the shared world through `EXT_memory_object_win32` and
//! `EXT_semaphore_win32`: the submission fence imports as a GL semaphore,
//! each shared texture as a memory object backing an immutable texture.
//! The function pointers come from `wglGetProcAddress`, which requires the
//! application's context to be current on the calling thread; session
//! creation is specified to run on such a thread.

use {
    super::submission::SubmissionDevice,
    crate::{
        backend::{Backend, HmdInfo},
        error::{RuntimeError, RuntimeResult},
        swapchain::Swapchain,
    },
    log::warn,
    openxr_sys as sys,
    std::{collections::HashMap, ffi::c_void},
    windows::{
        core::s,
        Win32::Graphics::OpenGL::{glFinish, glFlush, wglGetCurrentContext, wglGetProcAddress},
    },
};

const GL_HANDLE_TYPE_D3D12_FENCE_EXT: u32 = 0x9594;
const GL_HANDLE_TYPE_D3D11_IMAGE_EXT: u32 = 0x958B;
const GL_D3D12_FENCE_VALUE_EXT: u32 = 0x9595;
const GL_TEXTURE_2D: u32 = 0x0DE1;
const GL_TEXTURE_2D_ARRAY: u32 = 0x8C1A;

/// The `×2` on the import size is a documented quirk of the extension on
/// this driver stack; without it imports of the last image in the ring fail.
const IMPORT_SIZE_FUDGE: u64 = 2;

type GlGenSemaphores = unsafe extern "system" fn(i32, *mut u32);
type GlDeleteSemaphores = unsafe extern "system" fn(i32, *const u32);
type GlImportSemaphoreWin32Handle = unsafe extern "system" fn(u32, u32, *mut c_void);
type GlSemaphoreParameterUi64 = unsafe extern "system" fn(u32, u32, *const u64);
type GlSignalSemaphore =
    unsafe extern "system" fn(u32, u32, *const u32, u32, *const u32, *const u32);
type GlCreateMemoryObjects = unsafe extern "system" fn(i32, *mut u32);
type GlDeleteMemoryObjects = unsafe extern "system" fn(i32, *const u32);
type GlImportMemoryWin32Handle = unsafe extern "system" fn(u32, u64, u32, *mut c_void);
type GlCreateTextures = unsafe extern "system" fn(u32, i32, *mut u32);
type GlDeleteTextures = unsafe extern "system" fn(i32, *const u32);
type GlTextureStorageMem2D = unsafe extern "system" fn(u32, i32, u32, i32, i32, u32, u64);
type GlTextureStorageMem3D = unsafe extern "system" fn(u32, i32, u32, i32, i32, i32, u32, u64);

/// Extension entry points resolved against the application's context.
struct GlDispatch {
    gen_semaphores: GlGenSemaphores,
    delete_semaphores: GlDeleteSemaphores,
    import_semaphore_win32_handle: GlImportSemaphoreWin32Handle,
    semaphore_parameter_ui64: GlSemaphoreParameterUi64,
    signal_semaphore: GlSignalSemaphore,
    create_memory_objects: GlCreateMemoryObjects,
    delete_memory_objects: GlDeleteMemoryObjects,
    import_memory_win32_handle: GlImportMemoryWin32Handle,
    create_textures: GlCreateTextures,
    delete_textures: GlDeleteTextures,
    texture_storage_mem_2d: GlTextureStorageMem2D,
    texture_storage_mem_3d: GlTextureStorageMem3D,
}

macro_rules! gl_proc {
    ($name:expr, $ty:ty) => {{
        let proc = unsafe { wglGetProcAddress($name) };

        match proc {
            Some(proc) => unsafe { std::mem::transmute::<_, $ty>(proc) },
            None => {
                warn!("missing GL entry point {:?}", $name);

                return Err(RuntimeError::GraphicsDeviceInvalid);
            }
        }
    }};
}

impl GlDispatch {
    fn load() -> RuntimeResult<Self> {
        Ok(Self {
            gen_semaphores: gl_proc!(s!("glGenSemaphoresEXT"), GlGenSemaphores),
            delete_semaphores: gl_proc!(s!("glDeleteSemaphoresEXT"), GlDeleteSemaphores),
            import_semaphore_win32_handle: gl_proc!(
                s!("glImportSemaphoreWin32HandleEXT"),
                GlImportSemaphoreWin32Handle
            ),
            semaphore_parameter_ui64: gl_proc!(
                s!("glSemaphoreParameterui64vEXT"),
                GlSemaphoreParameterUi64
            ),
            signal_semaphore: gl_proc!(s!("glSignalSemaphoreEXT"), GlSignalSemaphore),
            create_memory_objects: gl_proc!(s!("glCreateMemoryObjectsEXT"), GlCreateMemoryObjects),
            delete_memory_objects: gl_proc!(s!("glDeleteMemoryObjectsEXT"), GlDeleteMemoryObjects),
            import_memory_win32_handle: gl_proc!(
                s!("glImportMemoryWin32HandleEXT"),
                GlImportMemoryWin32Handle
            ),
            create_textures: gl_proc!(s!("glCreateTextures"), GlCreateTextures),
            delete_textures: gl_proc!(s!("glDeleteTextures"), GlDeleteTextures),
            texture_storage_mem_2d: gl_proc!(s!("glTextureStorageMem2DEXT"), GlTextureStorageMem2D),
            texture_storage_mem_3d: gl_proc!(s!("glTextureStorageMem3DEXT"), GlTextureStorageMem3D),
        })
    }
}

struct ImportedTextures {
    textures: Vec<u32>,
    memory_objects: Vec<u32>,
}

/// Bridge for `XrGraphicsBindingOpenGLWin32KHR` sessions.
pub struct OpenGlBridge {
    submission: SubmissionDevice,
    dispatch: GlDispatch,

    /// The shared fence, imported as a GL semaphore.
    semaphore: u32,

    images: HashMap<u64, ImportedTextures>,
}

impl OpenGlBridge {
    #[profiling::function]
    pub fn new(
        binding: &sys::GraphicsBindingOpenGLWin32KHR,
        hmd_info: &HmdInfo,
    ) -> RuntimeResult<Self> {
        if binding.h_glrc.is_null() {
            return Err(RuntimeError::GraphicsDeviceInvalid);
        }

        // The extension loads happen against the current context; require
        // the application's context to actually be current.
        if unsafe { wglGetCurrentContext() }.is_invalid() {
            warn!("no OpenGL context is current on this thread");

            return Err(RuntimeError::GraphicsDeviceInvalid);
        }

        let dispatch = GlDispatch::load()?;
        let submission = SubmissionDevice::new(hmd_info.adapter_luid, "OpenGL")?;

        let mut semaphore = 0;
        unsafe {
            (dispatch.gen_semaphores)(1, &mut semaphore);
            (dispatch.import_semaphore_win32_handle)(
                semaphore,
                GL_HANDLE_TYPE_D3D12_FENCE_EXT,
                submission.fence_handle.0,
            );
        }

        Ok(Self {
            submission,
            dispatch,
            semaphore,
            images: HashMap::new(),
        })
    }

    pub fn submission_mut(&mut self) -> &mut SubmissionDevice {
        &mut self.submission
    }

    pub fn fence_value(&self) -> u64 {
        self.submission.fence_value
    }

    /// Signal the imported fence at the next value on the GL queue, wait on
    /// the submission context.
    #[profiling::function]
    pub fn serialize_app_frame(&mut self) -> RuntimeResult<()> {
        self.submission.fence_value += 1;
        let value = self.submission.fence_value;

        unsafe {
            (self.dispatch.semaphore_parameter_ui64)(
                self.semaphore,
                GL_D3D12_FENCE_VALUE_EXT,
                &value,
            );
            (self.dispatch.signal_semaphore)(
                self.semaphore,
                0,
                std::ptr::null(),
                0,
                std::ptr::null(),
                std::ptr::null(),
            );
            glFlush();

            self.submission
                .context
                .Wait(&self.submission.fence, value)
                .map_err(|_| RuntimeError::RuntimeFailure)?;
        }

        Ok(())
    }

    /// OpenGL has no queue handle to fence against; a full finish drains
    /// everything.
    pub fn flush_app_queue(&mut self) -> RuntimeResult<()> {
        self.submission.fence_value += 1;

        unsafe {
            glFinish();
        }

        Ok(())
    }

    /// Imports the swapchain's shared handles as GL textures and fills
    /// `XrSwapchainImageOpenGLKHR` entries.
    ///
    /// # Safety
    ///
    /// `images` must point at `count` `XrSwapchainImageOpenGLKHR` structs.
    pub unsafe fn write_swapchain_images(
        &mut self,
        backend: &dyn Backend,
        swapchain: &mut Swapchain,
        images: *mut sys::SwapchainImageBaseHeader,
        count: u32,
    ) -> RuntimeResult<()> {
        let key = swapchain.primary_chain().0;

        if !self.images.contains_key(&key) {
            let handles = self.submission.export_handles(backend, swapchain)?;
            let info = swapchain.info;

            let import_size = info.array_size as u64
                * info.width as u64
                * info.height as u64
                * info.sample_count as u64
                * swapchain.submission_format.bytes_per_texel() as u64
                * IMPORT_SIZE_FUDGE;

            let mut imported = ImportedTextures {
                textures: vec![0; handles.len()],
                memory_objects: vec![0; handles.len()],
            };

            for (index, handle) in handles.iter().enumerate() {
                unsafe {
                    (self.dispatch.create_memory_objects)(
                        1,
                        &mut imported.memory_objects[index],
                    );
                    (self.dispatch.import_memory_win32_handle)(
                        imported.memory_objects[index],
                        import_size,
                        GL_HANDLE_TYPE_D3D11_IMAGE_EXT,
                        handle.0,
                    );

                    let target = if info.array_size > 1 {
                        GL_TEXTURE_2D_ARRAY
                    } else {
                        GL_TEXTURE_2D
                    };
                    (self.dispatch.create_textures)(
                        target,
                        1,
                        &mut imported.textures[index],
                    );

                    if info.array_size > 1 {
                        (self.dispatch.texture_storage_mem_3d)(
                            imported.textures[index],
                            info.mip_count as i32,
                            info.format as u32,
                            info.width as i32,
                            info.height as i32,
                            info.array_size as i32,
                            imported.memory_objects[index],
                            0,
                        );
                    } else {
                        (self.dispatch.texture_storage_mem_2d)(
                            imported.textures[index],
                            info.mip_count as i32,
                            info.format as u32,
                            info.width as i32,
                            info.height as i32,
                            imported.memory_objects[index],
                            0,
                        );
                    }
                }
            }

            self.images.insert(key, imported);
        }

        let imported = &self.images[&key];
        let out = unsafe {
            std::slice::from_raw_parts_mut(
                images as *mut sys::SwapchainImageOpenGLKHR,
                count as usize,
            )
        };

        for (entry, texture) in out.iter_mut().zip(&imported.textures) {
            if entry.ty != sys::StructureType::SWAPCHAIN_IMAGE_OPENGL_KHR {
                return Err(RuntimeError::Validation);
            }

            entry.image = *texture;
        }

        Ok(())
    }

    pub fn forget_swapchain(&mut self, swapchain: &Swapchain) {
        if let Some(imported) = self.images.remove(&swapchain.primary_chain().0) {
            unsafe {
                (self.dispatch.delete_textures)(
                    imported.textures.len() as i32,
                    imported.textures.as_ptr(),
                );
                (self.dispatch.delete_memory_objects)(
                    imported.memory_objects.len() as i32,
                    imported.memory_objects.as_ptr(),
                );
            }
        }

        self.submission.forget_swapchain(swapchain.primary_chain().0);
    }
}

impl Drop for OpenGlBridge {
    fn drop(&mut self) {
        unsafe {
            (self.dispatch.delete_semaphores)(1, &self.semaphore);
        }
    }
}
