//! WebGPU render surface with in-shader YUV conversion

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info, instrument, warn};
use wgpu::*;
use winit::window::Window;

use super::renderer::RenderSurface;
use super::scale::aspect_scale;
use super::textures::{PlaneDesc, PlaneFormat, TextureAllocator, TextureSet};
use crate::capture::{FrameData, PixelFormat};
use crate::error::{Error, Result};
use crate::DisplayConfig;

const SHADER: &str = r#"
struct View {
    scale: vec2<f32>,
    mode: u32,
    swap_rb: u32,
};

@group(0) @binding(0) var<uniform> view: View;
@group(0) @binding(1) var tex_y: texture_2d<f32>;
@group(0) @binding(2) var tex_u: texture_2d<f32>;
@group(0) @binding(3) var tex_v: texture_2d<f32>;
@group(0) @binding(4) var samp: sampler;

struct VsOut {
    @builtin(position) pos: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VsOut {
    var corners = array<vec2<f32>, 4>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(1.0, -1.0),
        vec2<f32>(-1.0, 1.0),
        vec2<f32>(1.0, 1.0),
    );
    let p = corners[index];
    var out: VsOut;
    out.pos = vec4<f32>(p * view.scale, 0.0, 1.0);
    out.uv = vec2<f32>((p.x + 1.0) * 0.5, (1.0 - p.y) * 0.5);
    return out;
}

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    let first = textureSample(tex_y, samp, in.uv);
    let u = textureSample(tex_u, samp, in.uv).r - 0.5;
    let v = textureSample(tex_v, samp, in.uv).r - 0.5;

    if (view.mode == 1u) {
        // full-range YUV
        let y = first.r;
        let rgb = vec3<f32>(
            y + 1.140 * v,
            y - 0.395 * u - 0.581 * v,
            y + 2.032 * u,
        );
        return vec4<f32>(clamp(rgb, vec3<f32>(0.0), vec3<f32>(1.0)), 1.0);
    }
    if (view.swap_rb == 1u) {
        return vec4<f32>(first.b, first.g, first.r, 1.0);
    }
    return vec4<f32>(first.rgb, 1.0);
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ViewUniform {
    scale: [f32; 2],
    mode: u32,
    swap_rb: u32,
}

/// Device and queue, acting as the texture backend.
struct Gpu {
    device: Device,
    queue: Queue,
}

impl TextureAllocator for Gpu {
    type Texture = Texture;

    fn create(&mut self, desc: PlaneDesc) -> Texture {
        self.device.create_texture(&TextureDescriptor {
            label: Some("Frame Plane"),
            size: Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: match desc.format {
                PlaneFormat::Rgba8 => TextureFormat::Rgba8Unorm,
                PlaneFormat::R8 => TextureFormat::R8Unorm,
            },
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    fn write(&mut self, texture: &Texture, desc: PlaneDesc, data: &[u8]) {
        let bpp = match desc.format {
            PlaneFormat::Rgba8 => 4,
            PlaneFormat::R8 => 1,
        };
        self.queue.write_texture(
            ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            },
            data,
            ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bpp * desc.width),
                rows_per_image: Some(desc.height),
            },
            Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn release(&mut self, texture: Texture) {
        texture.destroy();
    }
}

/// GPU-accelerated render surface bound to a window
pub struct GpuSurface {
    gpu: Gpu,
    surface: Surface<'static>,
    surface_config: SurfaceConfiguration,
    pipeline: RenderPipeline,
    bind_group_layout: BindGroupLayout,
    sampler: Sampler,
    uniform: Buffer,
    /// Bound to the chroma slots while showing packed pictures
    placeholder: Texture,
    textures: TextureSet<Texture>,
    bind_group: Option<BindGroup>,
    pub window: Arc<Window>,
}

impl GpuSurface {
    #[instrument(skip(window, config))]
    pub async fn new(window: Arc<Window>, config: &DisplayConfig) -> Result<Self> {
        info!("Initializing WebGPU surface");

        let instance = Instance::new(InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(Arc::clone(&window))
            .map_err(|e| Error::Render(format!("surface creation failed: {}", e)))?;

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| Error::Render("no suitable GPU adapter found".into()))?;

        info!("GPU: {}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("Periscope GPU Device"),
                    required_features: Features::empty(),
                    required_limits: Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| Error::Render(format!("device request failed: {}", e)))?;

        // The shader outputs final display values, so skip sRGB re-encoding
        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .find(|f| !f.is_srgb())
            .or_else(|| caps.formats.first())
            .copied()
            .ok_or_else(|| Error::Render("surface reports no formats".into()))?;

        let size = window.inner_size();
        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: if config.vsync {
                PresentMode::AutoVsync
            } else {
                PresentMode::AutoNoVsync
            },
            alpha_mode: caps.alpha_modes.first().copied().unwrap_or(CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };
        surface.configure(&device, &surface_config);

        let bind_group_layout = create_bind_group_layout(&device);
        let pipeline = create_render_pipeline(&device, &bind_group_layout, format);

        let sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("Frame Sampler"),
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            ..Default::default()
        });

        let uniform = device.create_buffer(&BufferDescriptor {
            label: Some("View Uniform"),
            size: std::mem::size_of::<ViewUniform>() as u64,
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut gpu = Gpu { device, queue };
        let placeholder_desc = PlaneDesc {
            width: 1,
            height: 1,
            format: PlaneFormat::R8,
        };
        let placeholder = gpu.create(placeholder_desc);
        gpu.write(&placeholder, placeholder_desc, &[128]);

        Ok(Self {
            gpu,
            surface,
            surface_config,
            pipeline,
            bind_group_layout,
            sampler,
            uniform,
            placeholder,
            textures: TextureSet::new(),
            bind_group: None,
            window,
        })
    }

    fn rebuild_bind_group(&mut self) {
        let planes = self.textures.planes();
        let Some(luma) = planes.first() else {
            self.bind_group = None;
            return;
        };
        let view_of = |t: &Texture| t.create_view(&TextureViewDescriptor::default());
        let y = view_of(luma);
        let u = view_of(planes.get(1).unwrap_or(&self.placeholder));
        let v = view_of(planes.get(2).unwrap_or(&self.placeholder));

        self.bind_group = Some(self.gpu.device.create_bind_group(&BindGroupDescriptor {
            label: Some("Frame Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: self.uniform.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::TextureView(&y),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: BindingResource::TextureView(&u),
                },
                BindGroupEntry {
                    binding: 3,
                    resource: BindingResource::TextureView(&v),
                },
                BindGroupEntry {
                    binding: 4,
                    resource: BindingResource::Sampler(&self.sampler),
                },
            ],
        }));
    }

    fn view_uniform(&self) -> ViewUniform {
        let layout = self.textures.layout();
        let (sw, sh) = layout.map(|l| (l.width, l.height)).unwrap_or((0, 0));
        let scale = aspect_scale(self.surface_config.width, self.surface_config.height, sw, sh);
        let format = layout.map(|l| l.format);
        ViewUniform {
            scale: [scale.0, scale.1],
            mode: u32::from(format == Some(PixelFormat::Yuv420p)),
            swap_rb: u32::from(format == Some(PixelFormat::Bgr24)),
        }
    }
}

impl RenderSurface for GpuSurface {
    fn set_texture_data(
        &mut self,
        data: &FrameData,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<()> {
        let reallocated = self
            .textures
            .upload(&mut self.gpu, data, width, height, format)?;
        if reallocated {
            debug!("Frame textures allocated for {}x{} {:?}", width, height, format);
            self.rebuild_bind_group();
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.bind_group = None;
        self.textures.clear(&mut self.gpu);
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.surface.configure(&self.gpu.device, &self.surface_config);
    }

    fn paint(&mut self) -> Result<()> {
        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(SurfaceError::Lost | SurfaceError::Outdated) => {
                warn!("Surface lost, reconfiguring");
                self.surface.configure(&self.gpu.device, &self.surface_config);
                return Ok(());
            }
            Err(e) => return Err(Error::Render(format!("acquire frame failed: {}", e))),
        };
        let view = output
            .texture
            .create_view(&TextureViewDescriptor::default());

        self.gpu
            .queue
            .write_buffer(&self.uniform, 0, bytemuck::bytes_of(&self.view_uniform()));

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("Render Encoder"),
            });

        {
            let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("Render Pass"),
                color_attachments: &[Some(RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Clear(Color::BLACK),
                        store: StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });

            // Nothing uploaded (or cleared): leave the view black
            if let Some(bind_group) = &self.bind_group {
                render_pass.set_pipeline(&self.pipeline);
                render_pass.set_bind_group(0, bind_group, &[]);
                render_pass.draw(0..4, 0..1);
            }
        }

        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        self.window.pre_present_notify();
        output.present();
        Ok(())
    }
}

impl Drop for GpuSurface {
    fn drop(&mut self) {
        self.textures.clear(&mut self.gpu);
    }
}

fn create_bind_group_layout(device: &Device) -> BindGroupLayout {
    let texture_entry = |binding| BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::FRAGMENT,
        ty: BindingType::Texture {
            sample_type: TextureSampleType::Float { filterable: true },
            view_dimension: TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    };

    device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Some("Frame Bind Group Layout"),
        entries: &[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::VERTEX_FRAGMENT,
                ty: BindingType::Buffer {
                    ty: BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            texture_entry(1),
            texture_entry(2),
            texture_entry(3),
            BindGroupLayoutEntry {
                binding: 4,
                visibility: ShaderStages::FRAGMENT,
                ty: BindingType::Sampler(SamplerBindingType::Filtering),
                count: None,
            },
        ],
    })
}

fn create_render_pipeline(
    device: &Device,
    bind_group_layout: &BindGroupLayout,
    format: TextureFormat,
) -> RenderPipeline {
    let shader = device.create_shader_module(ShaderModuleDescriptor {
        label: Some("Frame Shader"),
        source: ShaderSource::Wgsl(SHADER.into()),
    });

    let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
        label: Some("Frame Pipeline Layout"),
        bind_group_layouts: &[bind_group_layout],
        push_constant_ranges: &[],
    });

    device.create_render_pipeline(&RenderPipelineDescriptor {
        label: Some("Frame Pipeline"),
        layout: Some(&pipeline_layout),
        cache: None,
        vertex: VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            compilation_options: Default::default(),
            buffers: &[],
        },
        fragment: Some(FragmentState {
            module: &shader,
            entry_point: Some("fs_main"),
            compilation_options: Default::default(),
            targets: &[Some(ColorTargetState {
                format,
                blend: Some(BlendState::REPLACE),
                write_mask: ColorWrites::ALL,
            })],
        }),
        primitive: PrimitiveState {
            topology: PrimitiveTopology::TriangleStrip,
            strip_index_format: None,
            front_face: FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: MultisampleState::default(),
        multiview: None,
    })
}
