//! Shared assembly fixtures for unit tests.

/// Minimal translated vertex shader in the shape the D3D9 translation layer emits: constants in
/// member 1 of the uniform block `%c`, read through static `%int_N` row indices 0 through 4.
pub const VERTEX_SHADER: &str = r#"OpCapability Shader
OpMemoryModel Logical GLSL450
OpEntryPoint Vertex %main "main" %out_color
%str = OpString "VS_test"
OpName %main "main"
OpName %Constants "Constants"
OpName %c "c"
OpName %out_color "out_color"
OpDecorate %out_color Location 0
OpDecorate %_arr_v4float_uint_64 ArrayStride 16
OpMemberDecorate %Constants 0 Offset 0
OpMemberDecorate %Constants 1 Offset 16
OpDecorate %Constants Block
OpDecorate %c DescriptorSet 0
OpDecorate %c Binding 0
%void = OpTypeVoid
%fn_void = OpTypeFunction %void
%float = OpTypeFloat 32
%v4float = OpTypeVector %float 4
%uint = OpTypeInt 32 0
%int = OpTypeInt 32 1
%uint_0 = OpConstant %uint 0
%uint_1 = OpConstant %uint 1
%uint_2 = OpConstant %uint 2
%uint_3 = OpConstant %uint 3
%uint_4 = OpConstant %uint 4
%uint_64 = OpConstant %uint 64
%int_0 = OpConstant %int 0
%int_1 = OpConstant %int 1
%int_2 = OpConstant %int 2
%int_3 = OpConstant %int 3
%int_4 = OpConstant %int 4
%_arr_v4float_uint_64 = OpTypeArray %v4float %uint_64
%Constants = OpTypeStruct %v4float %_arr_v4float_uint_64
%_ptr_Uniform_Constants = OpTypePointer Uniform %Constants
%_ptr_Uniform_v4float = OpTypePointer Uniform %v4float
%_ptr_Output_v4float = OpTypePointer Output %v4float
%_ptr_Function_v4float = OpTypePointer Function %v4float
%c = OpVariable %_ptr_Uniform_Constants Uniform
%out_color = OpVariable %_ptr_Output_v4float Output
%main = OpFunction %void None %fn_void
%entry = OpLabel
%r0 = OpAccessChain %_ptr_Uniform_v4float %c %uint_1 %int_0
%r1 = OpAccessChain %_ptr_Uniform_v4float %c %uint_1 %int_1
%r2 = OpAccessChain %_ptr_Uniform_v4float %c %uint_1 %int_2
%r3 = OpAccessChain %_ptr_Uniform_v4float %c %uint_1 %int_3
%r4 = OpAccessChain %_ptr_Uniform_v4float %c %uint_1 %int_4
%v0 = OpLoad %v4float %r0
%v1 = OpLoad %v4float %r1
%v2 = OpLoad %v4float %r2
%v3 = OpLoad %v4float %r3
%v4 = OpLoad %v4float %r4
%s01 = OpFAdd %v4float %v0 %v1
%s23 = OpFAdd %v4float %v2 %v3
%s0123 = OpFAdd %v4float %s01 %s23
%sum = OpFAdd %v4float %s0123 %v4
OpStore %out_color %sum
OpReturn
OpFunctionEnd
"#;
